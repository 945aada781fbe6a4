//! The SM adapter contract (spec.md §6): the callback surface through which
//! committed entries reach the user's state machine and through which
//! snapshots are produced and applied. Implementations beyond the three
//! named here are explicitly out of core scope (spec.md §1).

mod fs;
mod kvs;
mod null;

pub use fs::FsSm;
pub use kvs::KvsSm;
pub use null::NullSm;

use crate::error::DareResult;

/// Five callbacks in the original C source become a trait; Rust's `Drop`
/// replaces the explicit `destroy` callback (DESIGN NOTES: "Replace the
/// function-pointer table with a tagged-variant ... the adapter trait
/// interface remains the contract").
pub trait SmAdapter: Send {
    /// Applies a committed CSM command, returning the reply bytes sent back
    /// to the client.
    fn apply_cmd(&mut self, cmd: &[u8]) -> DareResult<Vec<u8>>;

    /// Current serialized size of the state machine, in bytes. Used to
    /// size the pre-registered snapshot buffer.
    fn size(&self) -> u32;

    /// Serializes the state machine into `buf`, returning the number of
    /// bytes written.
    fn create_snapshot(&self, buf: &mut [u8]) -> DareResult<u32>;

    /// Replaces the state machine's contents with the snapshot held in
    /// `buf`.
    fn apply_snapshot(&mut self, buf: &[u8]) -> DareResult<()>;
}

/// Tagged-variant dispatch over SM type (DESIGN NOTES), selected by
/// `config::Config::sm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmKind {
    Null,
    Kvs,
    Fs,
}

impl SmKind {
    pub fn from_str(s: &str) -> Option<SmKind> {
        match s {
            "null" => Some(SmKind::Null),
            "kvs" => Some(SmKind::Kvs),
            "fs" => Some(SmKind::Fs),
            _ => None,
        }
    }

    pub fn build(self) -> Box<dyn SmAdapter> {
        match self {
            SmKind::Null => Box::new(NullSm::new()),
            SmKind::Kvs => Box::new(KvsSm::new()),
            SmKind::Fs => Box::new(FsSm::new()),
        }
    }
}
