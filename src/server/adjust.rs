//! Post-election log adjustment (§4.5) and leadership verification (§4.4).
//!
//! A server that just won an election cannot trust its own replication
//! state against followers whose tails may have diverged under a prior
//! leader, so before it serves a single client request it:
//!
//! 1. Asks every peer, over the datagram channel, for its `(commit, end)`
//!    and NC-buffer (the spec's RMA reads of these fields are folded into
//!    one request/reply pair here -- see the precedent `election`
//!    documents for vote collection, the same reasoning applies: a
//!    reliable ordered datagram channel already gets us what a one-sided
//!    read buys, without needing to describe these fields' layout inside
//!    the shared log region).
//! 2. Runs `Log::find_remote_end` locally to find the first offset `m`
//!    where that peer's log might disagree with its own.
//! 3. Rewinds that peer's `next_offset`/`match_offset` to `m`, so the next
//!    `replicate_round` overwrites `[m, end)` with the leader's own bytes
//!    and the accompanying heartbeat's `end` field completes the
//!    truncate+extend (§4.2 "remote-log truncation").
//!
//! In parallel, this leader publishes its own term into a remote slot
//! every peer can read and reads every peer's slot back, to confirm a
//! quorum of them don't already show a higher term it simply hasn't heard
//! about yet over the (lossy, unordered) datagram channel. `leader_ready`
//! -- the gate `replication::handle_client_request` checks -- only becomes
//! true once both the adjustment handshake and this verification quorum
//! have completed.

use super::ServerContext;
use crate::error::{DareError, DareResult};
use crate::log::{NcBuffer, Payload};
use crate::protocol::{AdjustReply, AdjustRequest, DatagramMessage};
use crate::transport::Completion;

/// Kicks off adjustment right after a server declares itself leader:
/// appends the term-forcing NOOP (§4.4), publishes its term for
/// verification, and asks every peer to reconcile.
pub fn begin_adjustment(ctx: &mut ServerContext) -> DareResult<()> {
    ctx.log.recompute_tail();
    let term = ctx.current_term;
    ctx.log.append(term, 0, 0, Payload::Noop)?;

    ctx.pending_adjustments.clear();
    ctx.verify_acks.clear();
    ctx.verify_acks.insert(ctx.id);
    ctx.rma.publish_term(term)?;

    let peer_ids: Vec<u8> = ctx.peers.iter().map(|p| p.id).collect();
    if peer_ids.is_empty() {
        ctx.leader_ready = true;
        return Ok(());
    }

    let request = AdjustRequest {
        requester_id: ctx.id,
        term,
    };
    let bytes = DatagramMessage::AdjustRequest(request).encode()?;
    for id in peer_ids {
        ctx.pending_adjustments.insert(id);
        ctx.datagram.send_to(id, &bytes)?;
        let wr_id = ctx.rma.read_term(id)?;
        ctx.register_pending_verify(wr_id, id);
    }
    Ok(())
}

/// A peer answering a new leader's adjustment request with its own
/// `(commit, end)` and NC-buffer.
pub fn handle_adjust_request(ctx: &mut ServerContext, from: u8, msg: AdjustRequest) -> DareResult<()> {
    if msg.term < ctx.current_term {
        return Ok(());
    }
    if msg.term > ctx.current_term {
        super::election::step_down_on_higher_term(ctx, msg.term, Some(msg.requester_id))?;
    }
    let mut nc = NcBuffer::new();
    ctx.log.build_nc_buffer(&mut nc)?;
    let reply = AdjustReply {
        commit: ctx.log.commit_offset(),
        end: ctx.log.end(),
        nc_buffer: nc.encode(),
    };
    let bytes = DatagramMessage::AdjustReply(reply).encode()?;
    ctx.datagram.send_to(from, &bytes)
}

/// The new leader processing one peer's adjustment reply: computes the
/// mismatch offset and either rewinds that peer's send progress to it, or
/// -- if the mismatch predates what this leader still retains -- falls
/// back to sending that peer a full snapshot instead.
pub fn handle_adjust_reply(ctx: &mut ServerContext, from: u8, msg: AdjustReply) -> DareResult<()> {
    if !ctx.pending_adjustments.remove(&from) {
        return Ok(());
    }
    let remote_nc = NcBuffer::decode(&msg.nc_buffer)
        .ok_or_else(|| DareError::Encoding("malformed nc_buffer in adjust reply".into()))?;
    let m = ctx.log.find_remote_end(&remote_nc, msg.commit)?;

    if !ctx.log.is_empty() && ctx.log.is_larger(ctx.log.head(), m) {
        log::info!(
            "server {}: peer {} is behind this leader's retained head, sending a snapshot",
            ctx.id,
            from
        );
        super::snapshot::send_snapshot_to(ctx, from)?;
    } else {
        if let Some(peer) = ctx.peer_mut(from) {
            peer.match_offset = m;
            peer.next_offset = m;
        }
        // §4.5 step 4: the peer's own `end` is remotely corrected to `m`
        // before replication resumes from there, rather than left to
        // whatever it locally believed -- a diverged tail past `m` must be
        // truncated, not merely overwritten from `m` forward.
        ctx.rma.write_remote_end(from, m)?;
    }
    maybe_finish_adjustment(ctx)
}

/// Drains one leadership-verification read's completion (routed here from
/// `replication::poll_completions` whenever a completion doesn't match a
/// pending log write).
pub fn handle_read_completion(ctx: &mut ServerContext, completion: Completion) -> DareResult<()> {
    let peer_id = match ctx.take_pending_verify(completion.wr_id) {
        Some(id) => id,
        None => return Ok(()),
    };
    if !completion.success {
        return Ok(());
    }
    let term = match ctx.rma.take_term_result(completion.wr_id) {
        Some(t) => t,
        None => return Ok(()),
    };
    if term > ctx.current_term {
        return super::election::step_down_on_higher_term(ctx, term, None);
    }
    if term == ctx.current_term {
        ctx.verify_acks.insert(peer_id);
        maybe_finish_adjustment(ctx)?;
    }
    Ok(())
}

fn maybe_finish_adjustment(ctx: &mut ServerContext) -> DareResult<()> {
    if !ctx.is_leader() || !ctx.pending_adjustments.is_empty() {
        return Ok(());
    }
    if ctx.verify_acks.len() >= ctx.quorum_size() {
        ctx.leader_ready = true;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::log::Payload;
    use crate::server::clock::ManualClock;
    use crate::server::Role;
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
    fn single_member_group_is_immediately_leader_ready() {
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
        ctx.role = Role::Leader;
        begin_adjustment(&mut ctx).unwrap();
        assert!(ctx.leader_ready);
        assert_eq!(ctx.log.commit_offset(), 0);
    }

    #[test]
    fn matching_follower_reply_advances_match_offset_to_the_agreement_point() {
        let mut fabric = LoopbackFabric::new(3, 65536);
        let mut leader = make_ctx(0, &mut fabric);
        leader.role = Role::Leader;

        begin_adjustment(&mut leader).unwrap();
        assert_eq!(leader.pending_adjustments.len(), 2);

        let reply = AdjustReply {
            commit: 0,
            end: 0,
            nc_buffer: NcBuffer::new().encode(),
        };
        handle_adjust_reply(&mut leader, 1, reply).unwrap();
        assert_eq!(leader.peer(1).unwrap().match_offset, 0);
        assert!(!leader.leader_ready);
    }
}
