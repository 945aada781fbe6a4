//! Committed-entry application (§4.3): walks `[apply, commit)` in strict
//! index order, dispatching each entry to the state machine or to server
//! bookkeeping, and replies to the originating client once an entry the
//! leader appended on a client's behalf has run.

use super::state::PeerRecord;
use super::ServerContext;
use crate::error::DareResult;
use crate::log::Payload;
use crate::protocol::{ClientReply, ReplyStatus};

/// Applies every entry between `apply` and `commit`, in order, one at a
/// time. Safe to call on any role: a follower applies exactly the same
/// entries a leader does, just without owning the client reply.
pub fn apply_committed(ctx: &mut ServerContext) -> DareResult<()> {
    while ctx.log.has_unapplied_entries() {
        let offset = ctx.log.apply_offset();
        let (resolved, entry) = match ctx.log.entry_at(offset)? {
            Some(v) => v,
            None => break,
        };
        let next = ctx.log.next_offset(resolved, &entry);
        let req_id = entry.req_id;
        let clt_id = entry.clt_id;
        ctx.last_applied_entry = Some((entry.idx, entry.term, resolved));

        match entry.payload {
            Payload::Noop => {}
            Payload::Csm(cmd) => {
                let result = ctx.sm.apply_cmd(&cmd);
                if ctx.is_leader() && clt_id != 0 {
                    let (status, data) = match result {
                        Ok(data) => (ReplyStatus::Ok, data),
                        Err(_) => (ReplyStatus::SmError, Vec::new()),
                    };
                    let reply = ClientReply {
                        req_id,
                        status,
                        leader_hint: Some(ctx.id),
                        data,
                    };
                    ctx.client_table.record(clt_id, req_id, reply.clone());
                    super::replication::reply_to_client(ctx, clt_id as u8, reply)?;
                }
            }
            Payload::Config(new_config) => {
                let still_member = new_config.is_active(ctx.id);
                ctx.current_config = new_config;
                ctx.config_in_flight = false;
                sync_peer_list(ctx, new_config);
                if ctx.is_leader() && clt_id != 0 {
                    let reply = ClientReply {
                        req_id,
                        status: ReplyStatus::Ok,
                        leader_hint: Some(ctx.id),
                        data: Vec::new(),
                    };
                    ctx.client_table.record(clt_id, req_id, reply.clone());
                    super::replication::reply_to_client(ctx, clt_id as u8, reply)?;
                }
                if !still_member {
                    log::info!("server {}: removed from the group, shutting down", ctx.id);
                    ctx.shutdown_requested = true;
                }
            }
            Payload::Head(new_head) => {
                ctx.log.advance_head(new_head);
                ctx.head_advance_in_flight = false;
            }
        }

        ctx.log.advance_apply(next);
        if ctx.shutdown_requested {
            break;
        }
    }
    Ok(())
}

/// Adds a `PeerRecord` for every newly-active peer and drops one for every
/// peer the new configuration no longer lists, so `ctx.peers` always
/// mirrors `ctx.current_config` once a CONFIG entry has applied.
fn sync_peer_list(ctx: &mut ServerContext, config: crate::log::ConfigId) {
    ctx.peers.retain(|p| config.is_active(p.id));
    for id in 0u8..64 {
        if id != ctx.id && config.is_active(id) && ctx.peer(id).is_none() {
            ctx.peers.push(PeerRecord::new(id));
        }
    }
}
