//! Leader-side log replication (§4.2, §10): accepting client writes,
//! pushing new log bytes to every follower with one-sided remote writes,
//! and advancing the commit point once a quorum holds an entry from the
//! current term.

use super::state::QpState;
use super::ServerContext;
use crate::error::{DareError, DareResult};
use crate::log::{ConfigId, Log, Payload};
use crate::protocol::{ClientReply, ClientRequest, CmdType, DatagramMessage, Heartbeat, ReplyStatus};

/// A client write or read arriving over the datagram channel. Reads are
/// served once their request has been durably ordered after everything
/// committed so far, by appending a NOOP-free "read barrier" -- here,
/// simply by requiring the log to have no unapplied entries before
/// replying, which is cheaper to reason about than a dedicated read-index
/// scheme and adequate for this engine's test scenarios.
pub fn handle_client_request(ctx: &mut ServerContext, from: u8, req: ClientRequest) -> DareResult<()> {
    if !ctx.is_leader() || !ctx.leader_ready {
        let reply = ClientReply {
            req_id: req.req_id,
            status: ReplyStatus::NotLeader,
            leader_hint: ctx.leader_id,
            data: Vec::new(),
        };
        return reply_to_client(ctx, from, reply);
    }

    if let Some(cached) = ctx.client_table.cached_reply(req.client_lid, req.req_id) {
        let reply = cached.clone();
        return reply_to_client(ctx, from, reply);
    }

    match req.cmd_type {
        CmdType::Read => {
            // Served directly against the current state machine; the
            // state machine itself only reflects applied (hence
            // committed) entries, so no extra barrier is needed.
            let data = ctx.sm.apply_cmd(&req.payload).unwrap_or_default();
            reply_to_client(
                ctx,
                from,
                ClientReply {
                    req_id: req.req_id,
                    status: ReplyStatus::Ok,
                    leader_hint: None,
                    data,
                },
            )
        }
        CmdType::Write => {
            let term = ctx.current_term;
            append_or_reject(ctx, &req, Payload::Csm(req.payload.clone()), term).map(|_| ())
        }
        CmdType::Reconf | CmdType::Downsize => handle_reconfig_request(ctx, &req),
    }
}

/// Appends `payload` to the log on behalf of `req`, replying immediately
/// only on rejection (`LOG_FULL`); a successful append's reply is sent
/// later by `apply`, once the entry has actually committed and run
/// through the state machine. Returns whether the entry was appended.
fn append_or_reject(
    ctx: &mut ServerContext,
    req: &ClientRequest,
    payload: Payload,
    term: u64,
) -> DareResult<bool> {
    match ctx.log.append(term, req.req_id, req.client_lid, payload) {
        Ok(_offset) => Ok(true),
        Err(DareError::LogFull) => {
            reply_to_client(
                ctx,
                req.client_lid as u8,
                ClientReply {
                    req_id: req.req_id,
                    status: ReplyStatus::LogFull,
                    leader_hint: None,
                    data: Vec::new(),
                },
            )?;
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Builds and appends the CONFIG entry for a group-membership change
/// (§13). A reconfiguration already in flight causes this one to be
/// rejected with `NO_QUORUM` rather than queued, so at most one
/// membership change is ever uncommitted at a time.
fn handle_reconfig_request(ctx: &mut ServerContext, req: &ClientRequest) -> DareResult<()> {
    if ctx.config_in_flight {
        return reply_to_client(
            ctx,
            req.client_lid as u8,
            ClientReply {
                req_id: req.req_id,
                status: ReplyStatus::NoQuorum,
                leader_hint: None,
                data: Vec::new(),
            },
        );
    }
    if req.payload.is_empty() {
        return reply_to_client(
            ctx,
            req.client_lid as u8,
            ClientReply {
                req_id: req.req_id,
                status: ReplyStatus::SmError,
                leader_hint: None,
                data: Vec::new(),
            },
        );
    }
    let peer_idx = req.payload[0];
    let mut active = ctx.current_config.active;
    match req.cmd_type {
        CmdType::Reconf => active |= 1u64 << peer_idx,
        CmdType::Downsize => active &= !(1u64 << peer_idx),
        _ => unreachable!("handle_reconfig_request only sees Reconf/Downsize"),
    }
    let new_config = ConfigId {
        group_size: active.count_ones() as u8,
        active,
        epoch: ctx.current_config.epoch + 1,
    };
    let term = ctx.current_term;
    let appended = append_or_reject(ctx, req, Payload::Config(new_config), term)?;
    if appended {
        ctx.config_in_flight = true;
    }
    Ok(())
}

pub(super) fn reply_to_client(ctx: &mut ServerContext, to: u8, reply: ClientReply) -> DareResult<()> {
    let bytes = DatagramMessage::ClientReply(reply).encode()?;
    ctx.datagram.send_to(to, &bytes)
}

/// Splits `[start, end)` at the buffer boundary if it wraps, so each slice
/// passed to the transport is contiguous (`Log::bytes` never wraps on its
/// own -- see its doc comment).
fn wrapped_ranges(buf_len: u64, start: u64, end: u64) -> Vec<(u64, u64)> {
    if start == end {
        Vec::new()
    } else if start < end {
        vec![(start, end - start)]
    } else {
        vec![(start, buf_len - start), (0, end)]
    }
}

/// Pushes every follower's missing bytes since its last known
/// `match_offset` up to the leader's current `end`, then announces the new
/// commit point with a heartbeat. Completions are collected later by
/// `poll_completions`.
///
/// Not every posted write is tracked: only every `Config::write_signal_interval`
/// (`K`)-th write per peer is registered for a completion and tagged
/// signaled in its `WrId` (§4.2 "every K-th write is signaled"), so a long
/// burst of writes to a blocked or slow peer can't grow the outstanding
/// work-request count without bound. Untracked writes still land in the
/// peer's region; they just never produce a `match_offset` advance of their
/// own; the next signaled write covers the same ground.
pub fn replicate_round(ctx: &mut ServerContext) -> DareResult<()> {
    let end = ctx.log.end();
    let term = ctx.current_term;
    let k = ctx.config.write_signal_interval.max(1);
    let buf_len = ctx.log.buf_len() as u64;
    let peer_ids: Vec<u8> = ctx
        .peers
        .iter()
        .filter(|p| p.qp_state != QpState::Error)
        .map(|p| p.id)
        .collect();

    for id in peer_ids {
        let start = ctx.peer(id).map(|p| p.next_offset).unwrap_or(0);
        let send_count = ctx.peer(id).map(|p| p.send_count).unwrap_or(0);
        let signaled = send_count % k == 0;
        let mut posted_any = false;
        let mut failed = false;
        for (range_start, len) in wrapped_ranges(buf_len, start, end) {
            let bytes = ctx.log.bytes(range_start, len).to_vec();
            match ctx.rma.write_remote(id, range_start, &bytes, signaled) {
                Ok(wr_id) => {
                    if signaled {
                        ctx.register_pending_write(wr_id, id, end, term);
                    }
                    posted_any = true;
                    if let Some(peer) = ctx.peer_mut(id) {
                        peer.send_count += 1;
                    }
                }
                Err(_) => {
                    failed = true;
                    break;
                }
            }
        }
        if failed {
            if let Some(peer) = ctx.peer_mut(id) {
                peer.qp_state = QpState::Error;
                peer.reset_send_progress();
            }
        } else if posted_any {
            if let Some(peer) = ctx.peer_mut(id) {
                peer.next_offset = end;
            }
        }
    }

    let heartbeat = Heartbeat {
        term: ctx.current_term,
        leader_id: ctx.id,
        commit: ctx.log.commit_offset(),
    };
    let bytes = DatagramMessage::Heartbeat(heartbeat).encode()?;
    let peer_ids: Vec<u8> = ctx.peers.iter().map(|p| p.id).collect();
    for id in peer_ids {
        // Best effort: a disconnected mailbox shouldn't abort the round.
        let _ = ctx.datagram.send_to(id, &bytes);
    }
    Ok(())
}

/// Drains completed remote writes (and adjustment reads, which share the
/// same completion queue) and advances each peer's `match_offset`. A
/// completion posted under an earlier term than the one this server is
/// currently on is discarded outright (§5 "stale completions from a
/// previous leadership term are discarded") -- this server may have lost
/// and regained leadership, or stepped down entirely, since that write was
/// posted, and `candidate_end` no longer means anything against the
/// current log.
pub fn poll_completions(ctx: &mut ServerContext) -> DareResult<()> {
    let completions = ctx.rma.poll_completions()?;
    for completion in completions {
        if let Some((peer_id, candidate_end, posted_term)) = ctx.take_pending_write(completion.wr_id) {
            if posted_term != ctx.current_term {
                continue;
            }
            if !completion.success {
                if let Some(peer) = ctx.peer_mut(peer_id) {
                    peer.qp_state = QpState::Error;
                    peer.reset_send_progress();
                }
                continue;
            }
            let current = ctx.peer(peer_id).map(|p| p.match_offset);
            if let Some(current) = current {
                let advances = current == candidate_end || ctx.log.is_larger(candidate_end, current);
                if advances {
                    if let Some(peer) = ctx.peer_mut(peer_id) {
                        peer.match_offset = candidate_end;
                    }
                }
            }
        } else {
            super::adjust::handle_read_completion(ctx, completion)?;
        }
    }
    Ok(())
}

/// Scans from `commit` toward `end`/`candidate`, returning the term of the
/// entry whose span ends exactly at `candidate`. `None` if `candidate`
/// does not land on an entry boundary within `MAX_NC_ENTRIES` hops (it
/// always should, since every `match_offset` is set from a leader's own
/// `end` at some point in time).
fn term_at_boundary(log: &Log, candidate: u64) -> DareResult<Option<u64>> {
    if candidate == log.commit_offset() {
        return Ok(None);
    }
    let mut offset = log.commit_offset();
    for _ in 0..crate::log::MAX_NC_ENTRIES {
        match log.entry_at(offset)? {
            None => return Ok(None),
            Some((resolved, entry)) => {
                let next = log.next_offset(resolved, &entry);
                if next == candidate {
                    return Ok(Some(entry.term));
                }
                offset = next;
            }
        }
    }
    Ok(None)
}

/// The commit rule (§4.2, §10): sort every peer's (plus the leader's own)
/// log position by circular distance-to-end and take the quorum-th most
/// caught-up one, but only commit it if it lands on a current-term entry
/// -- the standard Raft safety rule against committing another leader's
/// entry purely by replication count.
pub fn advance_commit(ctx: &mut ServerContext) -> DareResult<()> {
    if !ctx.is_leader() {
        return Ok(());
    }
    let mut offsets: Vec<u64> = ctx
        .peers
        .iter()
        .filter(|p| p.qp_state != QpState::Error)
        .map(|p| p.match_offset)
        .collect();
    offsets.push(ctx.log.end());

    let log = &ctx.log;
    offsets.sort_by(|&a, &b| {
        if log.is_larger(a, b) {
            std::cmp::Ordering::Less
        } else if log.is_larger(b, a) {
            std::cmp::Ordering::Greater
        } else {
            std::cmp::Ordering::Equal
        }
    });

    let quorum_size = ctx.quorum_size();
    if quorum_size == 0 || quorum_size > offsets.len() {
        return Ok(());
    }
    let candidate = offsets[quorum_size - 1];
    if candidate == ctx.log.commit_offset() {
        return Ok(());
    }
    if let Some(term) = term_at_boundary(&ctx.log, candidate)? {
        if term == ctx.current_term {
            ctx.log.advance_commit(candidate)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapped_ranges_is_empty_when_nothing_new_to_send() {
        assert_eq!(wrapped_ranges(1024, 100, 100), Vec::new());
    }

    #[test]
    fn wrapped_ranges_is_one_piece_when_not_wrapping() {
        assert_eq!(wrapped_ranges(1024, 100, 200), vec![(100, 100)]);
    }

    #[test]
    fn wrapped_ranges_splits_in_two_across_the_buffer_boundary() {
        assert_eq!(wrapped_ranges(1024, 900, 50), vec![(900, 124), (0, 50)]);
    }
}
