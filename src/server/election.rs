//! Role transitions and the datagram dispatch table (§9, §11). DARE's vote
//! is a plain request/reply exchange here rather than the paper's
//! RMA-write-based "vote replication" -- our `DatagramTransport` already
//! gives every peer a reliable, ordered channel, so there is nothing the
//! one-sided write buys beyond what a message exchange gets for free. Vote
//! safety does not depend on comparing candidate/voter log length: DARE
//! relies on the post-election `adjust` phase to reconcile logs rather
//! than withholding votes from candidates with shorter logs, so no log
//! check gates `handle_request_vote`.

use super::{Role, ServerContext};
use crate::error::DareResult;
use crate::protocol::{DatagramMessage, Heartbeat, RequestVote, RequestVoteReply};

pub fn handle_datagram(ctx: &mut ServerContext, from: u8, bytes: &[u8]) -> DareResult<()> {
    let msg = DatagramMessage::decode(bytes)?;
    match msg {
        DatagramMessage::RequestVote(m) => handle_request_vote(ctx, from, m),
        DatagramMessage::RequestVoteReply(m) => handle_request_vote_reply(ctx, from, m),
        DatagramMessage::Heartbeat(m) => handle_heartbeat(ctx, from, m),
        DatagramMessage::ClientRequest(m) => super::replication::handle_client_request(ctx, from, m),
        DatagramMessage::ClientReply(_) => Ok(()),
        DatagramMessage::SnapshotRequest(m) => super::snapshot::handle_snapshot_request(ctx, from, m),
        DatagramMessage::SnapshotChunk(m) => super::snapshot::handle_snapshot_chunk(ctx, from, m),
        DatagramMessage::AdjustRequest(m) => super::adjust::handle_adjust_request(ctx, from, m),
        DatagramMessage::AdjustReply(m) => super::adjust::handle_adjust_reply(ctx, from, m),
    }
}

/// Begins a new election: bumps the term, votes for self, and asks every
/// peer for their vote. Called both from a follower whose timeout elapsed
/// and from a candidate whose previous round didn't reach a majority.
pub fn become_candidate(ctx: &mut ServerContext) -> DareResult<()> {
    log::info!("server {}: election timeout, starting term {}", ctx.id, ctx.current_term + 1);
    ctx.current_term += 1;
    ctx.role = Role::Candidate;
    ctx.voted_for = Some(ctx.id);
    ctx.leader_id = None;
    for peer in ctx.peers.iter_mut() {
        peer.reset_for_new_term();
    }
    ctx.election_timer.reset(ctx.clock.as_ref());

    let request = RequestVote {
        term: ctx.current_term,
        candidate_id: ctx.id,
    };
    let bytes = DatagramMessage::RequestVote(request).encode()?;
    let peer_ids: Vec<u8> = ctx.peers.iter().map(|p| p.id).collect();
    for id in peer_ids {
        ctx.datagram.send_to(id, &bytes)?;
    }

    become_leader_if_quorum_of_one(ctx)
}

/// A group of size one wins its own election with no votes to collect.
fn become_leader_if_quorum_of_one(ctx: &mut ServerContext) -> DareResult<()> {
    if ctx.quorum_size() <= 1 {
        become_leader(ctx)?;
    }
    Ok(())
}

fn become_leader(ctx: &mut ServerContext) -> DareResult<()> {
    log::info!("server {}: became leader for term {}", ctx.id, ctx.current_term);
    ctx.role = Role::Leader;
    ctx.leader_id = Some(ctx.id);
    ctx.leader_ready = false;
    ctx.config_in_flight = false;
    ctx.head_advance_in_flight = false;
    for peer in ctx.peers.iter_mut() {
        peer.match_offset = 0;
        peer.next_offset = 0;
        peer.send_count = 0;
    }
    ctx.log.invalidate_tail();
    super::adjust::begin_adjustment(ctx)
}

fn become_follower(ctx: &mut ServerContext, term: u64, leader_id: Option<u8>) -> DareResult<()> {
    if term > ctx.current_term {
        ctx.voted_for = None;
    }
    ctx.current_term = term;
    ctx.role = Role::Follower;
    ctx.leader_id = leader_id;
    ctx.leader_ready = false;
    ctx.election_timer.reset(ctx.clock.as_ref());
    Ok(())
}

/// Steps down to follower on observing a higher term, whether that term
/// arrived via a datagram (a vote, heartbeat or adjustment exchange) or via
/// a remote read of a peer's published term slot (§4.4 "discovered higher
/// term (via any message or remote read)"). Exposed to `adjust` for the
/// latter case.
pub(super) fn step_down_on_higher_term(
    ctx: &mut ServerContext,
    term: u64,
    leader_id: Option<u8>,
) -> DareResult<()> {
    become_follower(ctx, term, leader_id)
}

fn handle_request_vote(ctx: &mut ServerContext, from: u8, msg: RequestVote) -> DareResult<()> {
    if msg.term > ctx.current_term {
        become_follower(ctx, msg.term, None)?;
    }
    let grant = msg.term == ctx.current_term
        && (ctx.voted_for.is_none() || ctx.voted_for == Some(msg.candidate_id));
    if grant {
        ctx.voted_for = Some(msg.candidate_id);
        ctx.election_timer.reset(ctx.clock.as_ref());
    }
    let reply = RequestVoteReply {
        term: ctx.current_term,
        vote_granted: grant,
        voter_id: ctx.id,
    };
    let bytes = DatagramMessage::RequestVoteReply(reply).encode()?;
    ctx.datagram.send_to(from, &bytes)
}

fn handle_request_vote_reply(
    ctx: &mut ServerContext,
    from: u8,
    msg: RequestVoteReply,
) -> DareResult<()> {
    if msg.term > ctx.current_term {
        return become_follower(ctx, msg.term, None);
    }
    if ctx.role != Role::Candidate || msg.term != ctx.current_term || !msg.vote_granted {
        return Ok(());
    }
    if let Some(peer) = ctx.peer_mut(from) {
        peer.voted_for_me = true;
    }
    let votes = 1 + ctx.peers.iter().filter(|p| p.voted_for_me).count();
    if votes >= ctx.quorum_size() {
        become_leader(ctx)?;
    }
    Ok(())
}

/// A heartbeat asserts leadership and carries `(term, commit)` (§4.4); it is
/// advisory only (§4.2, §11) -- the source of truth for log *contents* is
/// the RMA-written log itself, not anything a leader claims over the
/// datagram channel. `ctx.log`'s `end` is therefore never set from a
/// heartbeat: `tick`'s follower branch derives it from what has actually
/// landed in the synced buffer (`Log::sync_end_from_content`) every round,
/// independent of heartbeat timing.
fn handle_heartbeat(ctx: &mut ServerContext, from: u8, msg: Heartbeat) -> DareResult<()> {
    if msg.term < ctx.current_term {
        return Ok(());
    }
    if ctx.role == Role::Leader && msg.term == ctx.current_term {
        return Ok(());
    }
    if msg.term > ctx.current_term || ctx.role != Role::Follower || ctx.leader_id != Some(from) {
        become_follower(ctx, msg.term, Some(from))?;
    } else {
        ctx.election_timer.reset(ctx.clock.as_ref());
    }
    ctx.log.advance_commit(msg.commit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::server::clock::ManualClock;
    use crate::sm::NullSm;
    use crate::transport::loopback::LoopbackFabric;

    const SAMPLE: &str = r#"{
        "me": 0,
        "peers": [
            {"id": 0, "datagram_addr": "127.0.0.1:9000"},
            {"id": 1, "datagram_addr": "127.0.0.1:9001"},
            {"id": 2, "datagram_addr": "127.0.0.1:9002"}
        ],
        "log_size_bytes": 65536
    }"#;

    fn make_ctx(id: u8, fabric: &mut LoopbackFabric) -> ServerContext {
        let mut cfg = Config::from_str(SAMPLE).unwrap();
        cfg.me = id;
        let (rma, datagram) = fabric.handle(id);
        ServerContext::new(
            cfg,
            Box::new(NullSm::new()),
            Box::new(rma),
            Box::new(datagram),
            Box::new(ManualClock::new()),
        )
    }

    #[test]
    fn single_member_group_becomes_leader_without_votes() {
        let mut cfg = Config::from_str(SAMPLE).unwrap();
        cfg.me = 0;
        cfg.peers.truncate(1);
        let mut fabric = LoopbackFabric::new(1, 4096);
        let (rma, datagram) = fabric.handle(0);
        let mut ctx = ServerContext::new(
            cfg,
            Box::new(NullSm::new()),
            Box::new(rma),
            Box::new(datagram),
            Box::new(ManualClock::new()),
        );
        become_candidate(&mut ctx).unwrap();
        assert_eq!(ctx.role, Role::Leader);
    }

    #[test]
    fn candidate_becomes_leader_once_it_collects_a_quorum_of_votes() {
        let mut fabric = LoopbackFabric::new(3, 4096);
        let mut ctx = make_ctx(0, &mut fabric);
        become_candidate(&mut ctx).unwrap();
        assert_eq!(ctx.role, Role::Candidate);

        handle_request_vote_reply(
            &mut ctx,
            1,
            RequestVoteReply {
                term: ctx.current_term,
                vote_granted: true,
                voter_id: 1,
            },
        )
        .unwrap();
        assert_eq!(ctx.role, Role::Leader);
    }

    #[test]
    fn seeing_a_higher_term_always_steps_down_to_follower() {
        let mut fabric = LoopbackFabric::new(3, 4096);
        let mut ctx = make_ctx(0, &mut fabric);
        become_candidate(&mut ctx).unwrap();
        handle_request_vote_reply(
            &mut ctx,
            1,
            RequestVoteReply {
                term: ctx.current_term + 5,
                vote_granted: false,
                voter_id: 1,
            },
        )
        .unwrap();
        assert_eq!(ctx.role, Role::Follower);
        assert_eq!(ctx.current_term, 6);
    }

    #[test]
    fn a_server_votes_once_per_term_and_refuses_a_second_candidate() {
        let mut fabric = LoopbackFabric::new(3, 4096);
        let mut ctx = make_ctx(0, &mut fabric);
        ctx.current_term = 1;
        handle_request_vote(
            &mut ctx,
            1,
            RequestVote {
                term: 1,
                candidate_id: 1,
            },
        )
        .unwrap();
        assert_eq!(ctx.voted_for, Some(1));

        handle_request_vote(
            &mut ctx,
            2,
            RequestVote {
                term: 1,
                candidate_id: 2,
            },
        )
        .unwrap();
        assert_eq!(ctx.voted_for, Some(1));
    }

    #[test]
    fn heartbeat_from_a_new_term_promotes_its_sender_to_leader() {
        let mut fabric = LoopbackFabric::new(3, 4096);
        let mut ctx = make_ctx(0, &mut fabric);
        handle_heartbeat(
            &mut ctx,
            1,
            Heartbeat {
                term: 3,
                leader_id: 1,
                commit: 0,
            },
        )
        .unwrap();
        assert_eq!(ctx.role, Role::Follower);
        assert_eq!(ctx.leader_id, Some(1));
        assert_eq!(ctx.current_term, 3);
    }
}
