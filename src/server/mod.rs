//! The server-side engine: election/heartbeat (`election`), leader
//! replication (`replication`), post-leadership-change log matching
//! (`adjust`), committed-entry application and snapshotting (`apply`,
//! `snapshot`). `ServerContext` is the single explicit handle these modules
//! operate on; there is no global/static server state.

mod adjust;
pub mod apply;
pub mod clock;
pub mod election;
pub mod replication;
pub mod snapshot;
mod state;

pub use clock::{Clock, ManualClock, SystemClock};
pub use state::{ElectionTimer, PeerRecord, QpState, Role};

use crate::config::Config;
use crate::log::{ConfigId, Log, NcBuffer};
use crate::protocol::ClientTable;
use crate::sm::SmAdapter;
use crate::transport::{DatagramTransport, RmaTransport, WrId};
use snapshot::SnapshotAssembly;
use std::collections::{HashMap, HashSet};

/// Everything one replica needs to run: its static config, its log and
/// state machine, its view of the other peers, and its transport handles.
/// Built once at startup and driven forward by repeated calls into
/// `election`, `replication`, `adjust` and `apply`.
pub struct ServerContext {
    pub id: u8,
    pub config: Config,
    pub role: Role,
    pub current_term: u64,
    pub voted_for: Option<u8>,
    pub leader_id: Option<u8>,
    pub log: Log,
    pub nc_buffer: NcBuffer,
    pub sm: Box<dyn SmAdapter>,
    pub client_table: ClientTable,
    pub peers: Vec<PeerRecord>,
    pub rma: Box<dyn RmaTransport>,
    pub datagram: Box<dyn DatagramTransport>,
    pub clock: Box<dyn Clock>,
    pub election_timer: ElectionTimer,
    /// The group membership currently in effect (applied from the most
    /// recent committed CONFIG entry, or the config file's static set if
    /// no reconfiguration has ever committed).
    pub current_config: ConfigId,
    /// True while a CONFIG entry this leader appended is still
    /// uncommitted. A further Reconf/Downsize request is rejected with
    /// `NO_QUORUM` rather than queued, per this engine's resolution of the
    /// "overlapping reconfigurations" question.
    pub config_in_flight: bool,
    /// Set once this leader's post-election log adjustment has settled.
    /// Client requests are refused with `NOT_LEADER` before that, since
    /// this server cannot yet be sure its log reflects everything a prior
    /// leader may have already committed.
    pub leader_ready: bool,
    /// Writes posted by `replication`/`adjust` that haven't completed yet,
    /// keyed by the `WrId` the transport returned: which peer the write
    /// targeted, what `match_offset` to advance that peer to once the write
    /// is observed complete, and the term it was posted under (so a
    /// completion arriving after this server has moved to a later term can
    /// be told apart from a still-relevant one and discarded).
    pending_writes: HashMap<WrId, (u8, u64, u64)>,
    /// Term-slot reads posted by `adjust::begin_adjustment`, keyed by the
    /// `WrId` the transport returned, naming which peer the read targeted.
    pending_verifies: HashMap<WrId, u8>,
    /// Peers this leader is still waiting on an `AdjustReply` from, after
    /// the most recent election (§4.5). Cleared as replies arrive;
    /// `leader_ready` only flips once this is empty and `verify_acks`
    /// reaches quorum.
    pending_adjustments: HashSet<u8>,
    /// Peers (including self) confirmed, via the term-slot read, not to be
    /// on a term higher than this leader's own (§4.4 leadership
    /// verification).
    verify_acks: HashSet<u8>,
    /// In-progress snapshot chunk assembly, keyed by the sending peer, for
    /// a follower that is receiving a snapshot transfer (§4.3, §8 scenario
    /// 5).
    snapshot_assembly: HashMap<u8, SnapshotAssembly>,
    /// `(idx, term, offset)` of the most recently applied entry, recorded
    /// so a snapshot produced afterward (or pushed to a lagging peer) can
    /// carry the determinant the recovering side needs to resume
    /// replication from (§3 Snapshot, §8 scenario 5).
    last_applied_entry: Option<(u64, u64, u64)>,
    /// Set while a leader-produced HEAD entry is appended but not yet
    /// applied, so `snapshot::maybe_snapshot` doesn't append a fresh HEAD
    /// entry every tick while the first one is still working its way
    /// through commit and apply.
    head_advance_in_flight: bool,
    /// Set once a CONFIG entry applies that removes this server from the
    /// group (§4.3 CONFIG handling); checked by the main loop to stop
    /// ticking this server.
    pub shutdown_requested: bool,
}

impl ServerContext {
    pub fn new(
        config: Config,
        sm: Box<dyn SmAdapter>,
        rma: Box<dyn RmaTransport>,
        datagram: Box<dyn DatagramTransport>,
        clock: Box<dyn Clock>,
    ) -> ServerContext {
        let id = config.me;
        let peers = config
            .peers
            .iter()
            .filter(|p| p.id != id)
            .map(|p| PeerRecord::new(p.id))
            .collect();
        let log = Log::new(config.log_size_bytes);
        let election_timer = ElectionTimer::new(
            config.election_timeout_min_ms,
            config.election_timeout_max_ms,
            clock.as_ref(),
        );
        let active = config
            .peers
            .iter()
            .fold(0u64, |acc, p| acc | (1u64 << p.id));
        let current_config = ConfigId {
            group_size: config.peers.len() as u8,
            active,
            epoch: 0,
        };
        ServerContext {
            id,
            config,
            role: Role::Follower,
            current_term: 0,
            voted_for: None,
            leader_id: None,
            log,
            nc_buffer: NcBuffer::new(),
            sm,
            client_table: ClientTable::new(),
            peers,
            rma,
            datagram,
            clock,
            election_timer,
            current_config,
            config_in_flight: false,
            leader_ready: false,
            pending_writes: HashMap::new(),
            pending_verifies: HashMap::new(),
            pending_adjustments: HashSet::new(),
            verify_acks: HashSet::new(),
            snapshot_assembly: HashMap::new(),
            last_applied_entry: None,
            head_advance_in_flight: false,
            shutdown_requested: false,
        }
    }

    pub fn peer_mut(&mut self, id: u8) -> Option<&mut PeerRecord> {
        self.peers.iter_mut().find(|p| p.id == id)
    }

    pub fn peer(&self, id: u8) -> Option<&PeerRecord> {
        self.peers.iter().find(|p| p.id == id)
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    /// Quorum size under the currently active membership (`current_config`,
    /// updated as CONFIG entries commit), not the static peer list the
    /// config file started with -- a downsize shrinks this as soon as its
    /// CONFIG entry commits, per §13.
    pub fn quorum_size(&self) -> usize {
        self.current_config.group_size as usize / 2 + 1
    }

    pub(crate) fn register_pending_write(&mut self, wr_id: WrId, peer_id: u8, candidate_end: u64, term: u64) {
        self.pending_writes.insert(wr_id, (peer_id, candidate_end, term));
    }

    pub(crate) fn take_pending_write(&mut self, wr_id: WrId) -> Option<(u8, u64, u64)> {
        self.pending_writes.remove(&wr_id)
    }

    pub(crate) fn register_pending_verify(&mut self, wr_id: WrId, peer_id: u8) {
        self.pending_verifies.insert(wr_id, peer_id);
    }

    pub(crate) fn take_pending_verify(&mut self, wr_id: WrId) -> Option<u8> {
        self.pending_verifies.remove(&wr_id)
    }

    /// Runs one cooperative iteration of the server loop: drains pending
    /// remote-memory completions, drains pending control datagrams, checks
    /// timers, and dispatches to the role-appropriate engine. Intended to
    /// be called in a tight loop (or driven step by step in tests).
    pub fn tick(&mut self) -> crate::error::DareResult<()> {
        replication::poll_completions(self)?;

        while let Some((from, bytes)) = self.datagram.try_recv()? {
            election::handle_datagram(self, from, &bytes)?;
        }

        match self.role {
            Role::Follower | Role::Candidate => {
                // A corrective push from a new leader's log adjustment
                // (§4.5 step 4) is an authoritative overwrite of this
                // server's own `end`, unlike anything carried by a
                // heartbeat -- apply it before re-deriving `end` from
                // content so a truncation actually takes effect instead of
                // being immediately re-extended past stale tail bytes.
                if let Some(pushed_end) = self.rma.take_pushed_end() {
                    self.log.set_end(pushed_end);
                }
                // Pull whatever the leader has one-sided-written into this
                // server's own region (§4.2): on real RDMA hardware the
                // write already lands in `log`'s backing memory, but
                // `loopback` keeps replicated bytes in a side buffer until
                // asked to copy them over.
                self.rma.sync_local_log(&mut self.log)?;
                // `end` is derived from what actually decodes in the synced
                // buffer, never from a leader's claimed offset -- heartbeats
                // carry only `(term, commit)` and are advisory (§4.4).
                self.log.sync_end_from_content();
                apply::apply_committed(self)?;
                if self.election_timer.expired(self.clock.as_ref()) {
                    election::become_candidate(self)?;
                }
            }
            Role::Leader => {
                replication::replicate_round(self)?;
                replication::advance_commit(self)?;
                apply::apply_committed(self)?;
                snapshot::maybe_snapshot(self)?;
            }
        }
        Ok(())
    }
}
