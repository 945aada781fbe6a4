use super::clock::Clock;
use rand::Rng;
use std::time::{Duration, Instant};

/// Mirrors `rc_qp_t.state` (`comparison/DARE/include/dare_ibv.h`): whether
/// a peer's queue pair is usable right now. `Blocked` means a send queue
/// is temporarily full and writes to it should be skipped this round
/// rather than retried inline; `Error` means the connection needs to be
/// re-established before this peer counts toward a quorum again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpState {
    Active,
    Blocked,
    Error,
}

/// Leader-side bookkeeping for one other member of the group.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub id: u8,
    pub qp_state: QpState,
    /// Highest log offset this peer is confirmed to hold, advanced only
    /// once the corresponding remote write completes. Used by the commit
    /// rule.
    pub match_offset: u64,
    /// Highest offset already posted as a remote write to this peer, which
    /// may be ahead of `match_offset` while that write is still in flight.
    /// `replicate_round` sends `[next_offset, end)` rather than
    /// `[match_offset, end)` so an unacknowledged write from the previous
    /// round isn't sent again every tick.
    pub next_offset: u64,
    /// Number of remote writes posted to this peer since it last reset
    /// (new term or new leader), for diagnostics.
    pub send_count: u64,
    /// Set once this peer's vote for the current term has been observed,
    /// either by a `RequestVoteReply` or (DARE-style) by reading the vote
    /// slot this candidate wrote into the peer's remote memory.
    pub voted_for_me: bool,
}

impl PeerRecord {
    pub fn new(id: u8) -> PeerRecord {
        PeerRecord {
            id,
            qp_state: QpState::Active,
            match_offset: 0,
            next_offset: 0,
            send_count: 0,
            voted_for_me: false,
        }
    }

    pub fn reset_for_new_term(&mut self) {
        self.voted_for_me = false;
    }

    /// Rewinds `next_offset` back to the last confirmed position, e.g.
    /// after a write failed and needs resending, or this server just
    /// became leader and has no confirmed progress against this peer yet.
    pub fn reset_send_progress(&mut self) {
        self.next_offset = self.match_offset;
    }
}

/// The three-state role machine (§9): `Leader`/`Candidate` carry no extra
/// data here, it lives alongside in `ServerState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Randomized election-timeout tracking (§9, §11): a deadline that resets
/// on every valid heartbeat or vote grant, to a fresh random point in
/// `[min, max)` so splits resolve with high probability.
pub struct ElectionTimer {
    min: Duration,
    max: Duration,
    deadline: Instant,
}

impl ElectionTimer {
    pub fn new(min_ms: u64, max_ms: u64, clock: &dyn Clock) -> ElectionTimer {
        let mut timer = ElectionTimer {
            min: Duration::from_millis(min_ms),
            max: Duration::from_millis(max_ms),
            deadline: clock.now(),
        };
        timer.reset(clock);
        timer
    }

    pub fn reset(&mut self, clock: &dyn Clock) {
        let min_ms = self.min.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;
        let timeout_ms = rand::thread_rng().gen_range(min_ms..max_ms);
        self.deadline = clock.now() + Duration::from_millis(timeout_ms);
    }

    pub fn expired(&self, clock: &dyn Clock) -> bool {
        clock.now() >= self.deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::clock::ManualClock;

    #[test]
    fn timer_is_not_expired_immediately_after_reset() {
        let clock = ManualClock::new();
        let timer = ElectionTimer::new(150, 300, &clock);
        assert!(!timer.expired(&clock));
    }

    #[test]
    fn timer_expires_once_max_interval_elapses() {
        let clock = ManualClock::new();
        let timer = ElectionTimer::new(150, 300, &clock);
        clock.advance(Duration::from_millis(301));
        assert!(timer.expired(&clock));
    }

    #[test]
    fn peer_record_forgets_its_vote_on_reset_for_new_term() {
        let mut peer = PeerRecord::new(1);
        peer.voted_for_me = true;
        peer.reset_for_new_term();
        assert!(!peer.voted_for_me);
    }
}
