//! The one-sided remote-memory transport contract (spec.md §7). This module
//! only defines the trait surface and a `loopback` in-process backend for
//! tests; a real RDMA/ibverbs backend is explicitly out of scope
//! (`comparison/DARE/include/dare_ibv.h` is grounding material only, never
//! wired up here).

pub mod loopback;
mod wrid;

pub use wrid::WrId;

use crate::error::DareResult;

/// A completed remote-memory operation, reported asynchronously by
/// `RmaTransport::poll_completions`. Mirrors polling an IB completion queue
/// for a previously posted `ibv_post_send`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub wr_id: WrId,
    pub success: bool,
}

/// One-sided remote memory access: the leader pushes log bytes directly
/// into a follower's pre-registered log buffer and reads a follower's
/// commit/apply offsets and NC-buffer back, without the follower's CPU
/// ever being interrupted. This is the entire replication data path
/// (§4.2); control messages (votes, heartbeats, client RPCs) travel over
/// `DatagramTransport` instead.
pub trait RmaTransport: Send {
    /// Writes `data` into peer `conn`'s remote buffer at `remote_offset`,
    /// returning a `WrId` that a later `poll_completions` call will report.
    /// `signaled` marks the returned `WrId`'s tag bit (§4.2 "every K-th
    /// write is signaled"); an unsignaled write still lands in the peer's
    /// region, it just isn't expected to be individually tracked.
    fn write_remote(&mut self, conn: u8, remote_offset: u64, data: &[u8], signaled: bool) -> DareResult<WrId>;

    /// Reads `len` bytes from peer `conn`'s remote buffer at
    /// `remote_offset` into a local buffer retrievable once the returned
    /// `WrId` completes; see `take_read_result`. `signaled` has the same
    /// meaning as in `write_remote`.
    fn read_remote(&mut self, conn: u8, remote_offset: u64, len: u64, signaled: bool) -> DareResult<WrId>;

    /// Authoritatively overwrites peer `conn`'s own `end` offset, the
    /// one-sided analogue of calling `Log::set_end` directly on that peer's
    /// log (§4.5 step 4: "remotely write the follower's `end = m`"). Unlike
    /// a heartbeat's `commit` field, this is a real memory mutation a
    /// follower can trust outright rather than merely advisory metadata.
    fn write_remote_end(&mut self, conn: u8, end: u64) -> DareResult<WrId>;

    /// Checks whether a peer has pushed a corrective `end` for this server
    /// since the last call, consuming it if so.
    fn take_pushed_end(&mut self) -> Option<u64>;

    /// Drains whatever remote operations have completed since the last
    /// call. Completion order does not imply issue order.
    fn poll_completions(&mut self) -> DareResult<Vec<Completion>>;

    /// Retrieves the bytes fetched by a completed `read_remote`, once.
    /// Returns `None` if `wr_id` does not name a completed read or its
    /// result was already taken.
    fn take_read_result(&mut self, wr_id: WrId) -> Option<Vec<u8>>;

    /// Copies whatever bytes have landed in this server's own
    /// remotely-writable log region into `log`'s buffer. A real RDMA
    /// backend needs no such step -- the NIC writes directly into
    /// registered memory that already *is* the log buffer -- but an
    /// in-process double keeps the two separate, so every tick has to pull
    /// a follower's replicated bytes across before `log` is read.
    fn sync_local_log(&mut self, log: &mut crate::log::Log) -> DareResult<()>;

    /// Publishes this server's own current term into a well-known remote
    /// slot other peers can read, for post-election leadership
    /// verification (§4.4): a would-be leader confirms no peer is already
    /// on a higher term it hasn't heard about over the datagram channel
    /// before declaring itself ready to serve writes.
    fn publish_term(&mut self, term: u64) -> DareResult<()>;

    /// Issues a remote read of peer `conn`'s published term, completing
    /// asynchronously like `read_remote`.
    fn read_term(&mut self, conn: u8) -> DareResult<WrId>;

    /// Retrieves the term fetched by a completed `read_term`, once.
    fn take_term_result(&mut self, wr_id: WrId) -> Option<u64>;
}

/// Unordered, best-effort control-message datagrams: votes, heartbeats,
/// client requests/replies, and snapshot chunk transfer. Carries capnp
/// payloads (`dare_capnp`).
pub trait DatagramTransport: Send {
    fn send_to(&mut self, conn: u8, data: &[u8]) -> DareResult<()>;

    /// Non-blocking receive; returns `None` if nothing is pending.
    fn try_recv(&mut self) -> DareResult<Option<(u8, Vec<u8>)>>;
}
