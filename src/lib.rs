//! A leader-based replicated log engine.
//!
//! Clients submit commands to the current leader; the leader appends them
//! to its log, replicates them to followers with one-sided remote memory
//! writes, and once a quorum holds them, commits and applies them to a
//! pluggable state machine. See `SPEC_FULL.md` at the repository root for
//! the full design.

#[macro_use]
extern crate rustc_serialize;

pub mod dare_capnp {
    include!(concat!(env!("OUT_DIR"), "/dare_capnp.rs"));
}

pub mod config;
pub mod error;
pub mod log;
pub mod protocol;
pub mod sm;
pub mod server;
pub mod transport;

pub use error::DareError;
