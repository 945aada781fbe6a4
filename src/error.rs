use std::error::Error as StdError;
use std::fmt;
use std::io;

/// Error kinds per the error-handling design: every fallible core operation
/// returns a `DareError` rather than unwinding. `TRANSIENT_NET` is retried
/// at the transport layer and never surfaces here; everything else is
/// either handled internally (logged) or surfaced to a client as a reply
/// status.
#[derive(Debug)]
pub enum DareError {
    /// A peer's QP/connection is unusable; the peer has been marked inactive.
    PeerError(u8),
    /// The log has no room for a new entry; caller must back off until a
    /// HEAD entry commits and reclaims space.
    LogFull,
    /// A message or remote read revealed a higher term than ours; caller
    /// must step down to follower.
    StaleTerm(u64),
    /// Fewer than a quorum of peers are reachable; the operation cannot be
    /// served right now.
    NoQuorum,
    /// The state machine adapter reported an unrecoverable error. Fatal:
    /// the server that observes this shuts down.
    SmError(String),
    /// Wraps an I/O failure from config loading or a transport backend.
    Io(io::Error),
    /// Wraps a capnp (de)serialization failure on the datagram channel.
    Capnp(capnp::Error),
    /// A config file or wire message was structurally invalid.
    Encoding(String),
}

impl fmt::Display for DareError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DareError::PeerError(idx) => write!(f, "peer {} is unreachable", idx),
            DareError::LogFull => write!(f, "log is full"),
            DareError::StaleTerm(term) => write!(f, "observed higher term {}", term),
            DareError::NoQuorum => write!(f, "no quorum of peers available"),
            DareError::SmError(msg) => write!(f, "state machine error: {}", msg),
            DareError::Io(e) => write!(f, "io error: {}", e),
            DareError::Capnp(e) => write!(f, "capnp error: {}", e),
            DareError::Encoding(msg) => write!(f, "encoding error: {}", msg),
        }
    }
}

impl StdError for DareError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            DareError::Io(e) => Some(e),
            DareError::Capnp(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for DareError {
    fn from(e: io::Error) -> Self {
        DareError::Io(e)
    }
}

impl From<capnp::Error> for DareError {
    fn from(e: capnp::Error) -> Self {
        DareError::Capnp(e)
    }
}

pub type DareResult<T> = Result<T, DareError>;
