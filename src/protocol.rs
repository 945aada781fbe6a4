//! Rust-side wrappers around the capnp wire messages defined in
//! `schema/dare.capnp`, plus the per-client dedup cache (§8) that lets a
//! leader answer a retried request without re-applying it.

use crate::dare_capnp::{
    adjust_reply, adjust_request, client_reply, client_request, heartbeat, request_vote,
    request_vote_reply, snapshot_chunk, snapshot_request, CmdType as WireCmdType,
    ReplyStatus as WireReplyStatus,
};
use crate::error::{DareError, DareResult};
use capnp::message::{Builder, HeapAllocator, Reader, ReaderOptions};
use capnp::serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdType {
    Read,
    Write,
    Reconf,
    Downsize,
}

impl CmdType {
    fn to_wire(self) -> WireCmdType {
        match self {
            CmdType::Read => WireCmdType::Read,
            CmdType::Write => WireCmdType::Write,
            CmdType::Reconf => WireCmdType::Reconf,
            CmdType::Downsize => WireCmdType::Downsize,
        }
    }

    fn from_wire(w: WireCmdType) -> CmdType {
        match w {
            WireCmdType::Read => CmdType::Read,
            WireCmdType::Write => CmdType::Write,
            WireCmdType::Reconf => CmdType::Reconf,
            WireCmdType::Downsize => CmdType::Downsize,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Ok,
    LogFull,
    NoQuorum,
    NotLeader,
    SmError,
}

impl ReplyStatus {
    fn to_wire(self) -> WireReplyStatus {
        match self {
            ReplyStatus::Ok => WireReplyStatus::Ok,
            ReplyStatus::LogFull => WireReplyStatus::LogFull,
            ReplyStatus::NoQuorum => WireReplyStatus::NoQuorum,
            ReplyStatus::NotLeader => WireReplyStatus::NotLeader,
            ReplyStatus::SmError => WireReplyStatus::SmError,
        }
    }

    fn from_wire(w: WireReplyStatus) -> ReplyStatus {
        match w {
            WireReplyStatus::Ok => ReplyStatus::Ok,
            WireReplyStatus::LogFull => ReplyStatus::LogFull,
            WireReplyStatus::NoQuorum => ReplyStatus::NoQuorum,
            WireReplyStatus::NotLeader => ReplyStatus::NotLeader,
            WireReplyStatus::SmError => ReplyStatus::SmError,
        }
    }
}

fn read_message(buf: &[u8]) -> DareResult<Reader<capnp::serialize::OwnedSegments>> {
    serialize::read_message(buf, ReaderOptions::new()).map_err(DareError::from)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRequest {
    pub client_lid: u16,
    pub req_id: u64,
    pub cmd_type: CmdType,
    pub payload: Vec<u8>,
}

impl ClientRequest {
    pub fn encode(&self) -> DareResult<Vec<u8>> {
        let mut message = Builder::new(HeapAllocator::new());
        {
            let mut root = message.init_root::<client_request::Builder>();
            root.set_client_lid(self.client_lid);
            root.set_req_id(self.req_id);
            root.set_cmd_type(self.cmd_type.to_wire());
            root.set_payload(&self.payload);
        }
        let mut out = Vec::new();
        serialize::write_message(&mut out, &message)?;
        Ok(out)
    }

    pub fn decode(buf: &[u8]) -> DareResult<ClientRequest> {
        let message = read_message(buf)?;
        let root = message.get_root::<client_request::Reader>()?;
        Ok(ClientRequest {
            client_lid: root.get_client_lid(),
            req_id: root.get_req_id(),
            cmd_type: CmdType::from_wire(root.get_cmd_type()?),
            payload: root.get_payload()?.to_vec(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientReply {
    pub req_id: u64,
    pub status: ReplyStatus,
    pub leader_hint: Option<u8>,
    pub data: Vec<u8>,
}

impl ClientReply {
    pub fn encode(&self) -> DareResult<Vec<u8>> {
        let mut message = Builder::new(HeapAllocator::new());
        {
            let mut root = message.init_root::<client_reply::Builder>();
            root.set_req_id(self.req_id);
            root.set_status(self.status.to_wire());
            root.set_has_leader_hint(self.leader_hint.is_some());
            root.set_leader_hint(self.leader_hint.unwrap_or(0));
            root.set_data(&self.data);
        }
        let mut out = Vec::new();
        serialize::write_message(&mut out, &message)?;
        Ok(out)
    }

    pub fn decode(buf: &[u8]) -> DareResult<ClientReply> {
        let message = read_message(buf)?;
        let root = message.get_root::<client_reply::Reader>()?;
        let leader_hint = if root.get_has_leader_hint() {
            Some(root.get_leader_hint())
        } else {
            None
        };
        Ok(ClientReply {
            req_id: root.get_req_id(),
            status: ReplyStatus::from_wire(root.get_status()?),
            leader_hint,
            data: root.get_data()?.to_vec(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestVote {
    pub term: u64,
    pub candidate_id: u8,
}

impl RequestVote {
    pub fn encode(&self) -> DareResult<Vec<u8>> {
        let mut message = Builder::new(HeapAllocator::new());
        {
            let mut root = message.init_root::<request_vote::Builder>();
            root.set_term(self.term);
            root.set_candidate_id(self.candidate_id);
        }
        let mut out = Vec::new();
        serialize::write_message(&mut out, &message)?;
        Ok(out)
    }

    pub fn decode(buf: &[u8]) -> DareResult<RequestVote> {
        let message = read_message(buf)?;
        let root = message.get_root::<request_vote::Reader>()?;
        Ok(RequestVote {
            term: root.get_term(),
            candidate_id: root.get_candidate_id(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestVoteReply {
    pub term: u64,
    pub vote_granted: bool,
    pub voter_id: u8,
}

impl RequestVoteReply {
    pub fn encode(&self) -> DareResult<Vec<u8>> {
        let mut message = Builder::new(HeapAllocator::new());
        {
            let mut root = message.init_root::<request_vote_reply::Builder>();
            root.set_term(self.term);
            root.set_vote_granted(self.vote_granted);
            root.set_voter_id(self.voter_id);
        }
        let mut out = Vec::new();
        serialize::write_message(&mut out, &message)?;
        Ok(out)
    }

    pub fn decode(buf: &[u8]) -> DareResult<RequestVoteReply> {
        let message = read_message(buf)?;
        let root = message.get_root::<request_vote_reply::Reader>()?;
        Ok(RequestVoteReply {
            term: root.get_term(),
            vote_granted: root.get_vote_granted(),
            voter_id: root.get_voter_id(),
        })
    }
}

/// `(term, commit)` only (§4.4) -- advisory metadata, not the source of
/// truth for log contents. A follower never trusts a claimed log `end`
/// from this message; see `server::election::handle_heartbeat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pub term: u64,
    pub leader_id: u8,
    pub commit: u64,
}

impl Heartbeat {
    pub fn encode(&self) -> DareResult<Vec<u8>> {
        let mut message = Builder::new(HeapAllocator::new());
        {
            let mut root = message.init_root::<heartbeat::Builder>();
            root.set_term(self.term);
            root.set_leader_id(self.leader_id);
            root.set_commit(self.commit);
        }
        let mut out = Vec::new();
        serialize::write_message(&mut out, &message)?;
        Ok(out)
    }

    pub fn decode(buf: &[u8]) -> DareResult<Heartbeat> {
        let message = read_message(buf)?;
        let root = message.get_root::<heartbeat::Reader>()?;
        Ok(Heartbeat {
            term: root.get_term(),
            leader_id: root.get_leader_id(),
            commit: root.get_commit(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotRequest {
    pub requester_id: u8,
}

impl SnapshotRequest {
    pub fn encode(&self) -> DareResult<Vec<u8>> {
        let mut message = Builder::new(HeapAllocator::new());
        {
            let mut root = message.init_root::<snapshot_request::Builder>();
            root.set_requester_id(self.requester_id);
        }
        let mut out = Vec::new();
        serialize::write_message(&mut out, &message)?;
        Ok(out)
    }

    pub fn decode(buf: &[u8]) -> DareResult<SnapshotRequest> {
        let message = read_message(buf)?;
        let root = message.get_root::<snapshot_request::Reader>()?;
        Ok(SnapshotRequest {
            requester_id: root.get_requester_id(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotChunk {
    pub last_idx: u64,
    pub last_term: u64,
    pub last_offset: u64,
    pub total_len: u32,
    pub chunk_offset: u32,
    pub bytes: Vec<u8>,
    pub is_final: bool,
}

impl SnapshotChunk {
    pub fn encode(&self) -> DareResult<Vec<u8>> {
        let mut message = Builder::new(HeapAllocator::new());
        {
            let mut root = message.init_root::<snapshot_chunk::Builder>();
            root.set_last_idx(self.last_idx);
            root.set_last_term(self.last_term);
            root.set_last_offset(self.last_offset);
            root.set_total_len(self.total_len);
            root.set_chunk_offset(self.chunk_offset);
            root.set_bytes(&self.bytes);
            root.set_is_final(self.is_final);
        }
        let mut out = Vec::new();
        serialize::write_message(&mut out, &message)?;
        Ok(out)
    }

    pub fn decode(buf: &[u8]) -> DareResult<SnapshotChunk> {
        let message = read_message(buf)?;
        let root = message.get_root::<snapshot_chunk::Reader>()?;
        Ok(SnapshotChunk {
            last_idx: root.get_last_idx(),
            last_term: root.get_last_term(),
            last_offset: root.get_last_offset(),
            total_len: root.get_total_len(),
            chunk_offset: root.get_chunk_offset(),
            bytes: root.get_bytes()?.to_vec(),
            is_final: root.get_is_final(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdjustRequest {
    pub requester_id: u8,
    pub term: u64,
}

impl AdjustRequest {
    pub fn encode(&self) -> DareResult<Vec<u8>> {
        let mut message = Builder::new(HeapAllocator::new());
        {
            let mut root = message.init_root::<adjust_request::Builder>();
            root.set_requester_id(self.requester_id);
            root.set_term(self.term);
        }
        let mut out = Vec::new();
        serialize::write_message(&mut out, &message)?;
        Ok(out)
    }

    pub fn decode(buf: &[u8]) -> DareResult<AdjustRequest> {
        let message = read_message(buf)?;
        let root = message.get_root::<adjust_request::Reader>()?;
        Ok(AdjustRequest {
            requester_id: root.get_requester_id(),
            term: root.get_term(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdjustReply {
    pub commit: u64,
    pub end: u64,
    pub nc_buffer: Vec<u8>,
}

impl AdjustReply {
    pub fn encode(&self) -> DareResult<Vec<u8>> {
        let mut message = Builder::new(HeapAllocator::new());
        {
            let mut root = message.init_root::<adjust_reply::Builder>();
            root.set_commit(self.commit);
            root.set_end(self.end);
            root.set_nc_buffer(&self.nc_buffer);
        }
        let mut out = Vec::new();
        serialize::write_message(&mut out, &message)?;
        Ok(out)
    }

    pub fn decode(buf: &[u8]) -> DareResult<AdjustReply> {
        let message = read_message(buf)?;
        let root = message.get_root::<adjust_reply::Reader>()?;
        Ok(AdjustReply {
            commit: root.get_commit(),
            end: root.get_end(),
            nc_buffer: root.get_nc_buffer()?.to_vec(),
        })
    }
}

/// A datagram's first byte names which of the above messages follows,
/// since capnp alone does not self-describe which struct a buffer holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum MessageTag {
    RequestVote = 0,
    RequestVoteReply = 1,
    Heartbeat = 2,
    ClientRequest = 3,
    ClientReply = 4,
    SnapshotRequest = 5,
    SnapshotChunk = 6,
    AdjustRequest = 7,
    AdjustReply = 8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatagramMessage {
    RequestVote(RequestVote),
    RequestVoteReply(RequestVoteReply),
    Heartbeat(Heartbeat),
    ClientRequest(ClientRequest),
    ClientReply(ClientReply),
    SnapshotRequest(SnapshotRequest),
    SnapshotChunk(SnapshotChunk),
    AdjustRequest(AdjustRequest),
    AdjustReply(AdjustReply),
}

impl DatagramMessage {
    pub fn encode(&self) -> DareResult<Vec<u8>> {
        let (tag, body) = match self {
            DatagramMessage::RequestVote(m) => (MessageTag::RequestVote, m.encode()?),
            DatagramMessage::RequestVoteReply(m) => (MessageTag::RequestVoteReply, m.encode()?),
            DatagramMessage::Heartbeat(m) => (MessageTag::Heartbeat, m.encode()?),
            DatagramMessage::ClientRequest(m) => (MessageTag::ClientRequest, m.encode()?),
            DatagramMessage::ClientReply(m) => (MessageTag::ClientReply, m.encode()?),
            DatagramMessage::SnapshotRequest(m) => (MessageTag::SnapshotRequest, m.encode()?),
            DatagramMessage::SnapshotChunk(m) => (MessageTag::SnapshotChunk, m.encode()?),
            DatagramMessage::AdjustRequest(m) => (MessageTag::AdjustRequest, m.encode()?),
            DatagramMessage::AdjustReply(m) => (MessageTag::AdjustReply, m.encode()?),
        };
        let mut out = Vec::with_capacity(1 + body.len());
        out.push(tag as u8);
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn decode(buf: &[u8]) -> DareResult<DatagramMessage> {
        if buf.is_empty() {
            return Err(DareError::Encoding("empty datagram".into()));
        }
        let body = &buf[1..];
        Ok(match buf[0] {
            0 => DatagramMessage::RequestVote(RequestVote::decode(body)?),
            1 => DatagramMessage::RequestVoteReply(RequestVoteReply::decode(body)?),
            2 => DatagramMessage::Heartbeat(Heartbeat::decode(body)?),
            3 => DatagramMessage::ClientRequest(ClientRequest::decode(body)?),
            4 => DatagramMessage::ClientReply(ClientReply::decode(body)?),
            5 => DatagramMessage::SnapshotRequest(SnapshotRequest::decode(body)?),
            6 => DatagramMessage::SnapshotChunk(SnapshotChunk::decode(body)?),
            7 => DatagramMessage::AdjustRequest(AdjustRequest::decode(body)?),
            8 => DatagramMessage::AdjustReply(AdjustReply::decode(body)?),
            other => return Err(DareError::Encoding(format!("unknown message tag {}", other))),
        })
    }
}

/// Per-client last-request cache: once a leader applies request `req_id`
/// from client `client_lid`, it remembers the reply so a retransmitted
/// request (the client never heard the first reply) gets the same answer
/// instead of being applied twice. Cleared whenever the log is reset from
/// a snapshot, since request history before the snapshot is gone.
#[derive(Debug, Default)]
pub struct ClientTable {
    last: HashMap<u16, (u64, ClientReply)>,
}

impl ClientTable {
    pub fn new() -> ClientTable {
        ClientTable {
            last: HashMap::new(),
        }
    }

    /// Returns the cached reply if `req_id` was already applied for this
    /// client, so the caller can skip re-applying it.
    pub fn cached_reply(&self, client_lid: u16, req_id: u64) -> Option<&ClientReply> {
        match self.last.get(&client_lid) {
            Some((cached_id, reply)) if *cached_id == req_id => Some(reply),
            _ => None,
        }
    }

    pub fn record(&mut self, client_lid: u16, req_id: u64, reply: ClientReply) {
        self.last.insert(client_lid, (req_id, reply));
    }

    pub fn clear(&mut self) {
        self.last.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_request_round_trips() {
        let req = ClientRequest {
            client_lid: 7,
            req_id: 42,
            cmd_type: CmdType::Write,
            payload: b"put k v".to_vec(),
        };
        let decoded = ClientRequest::decode(&req.encode().unwrap()).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn client_reply_round_trips_with_leader_hint() {
        let reply = ClientReply {
            req_id: 42,
            status: ReplyStatus::NotLeader,
            leader_hint: Some(2),
            data: Vec::new(),
        };
        let decoded = ClientReply::decode(&reply.encode().unwrap()).unwrap();
        assert_eq!(decoded, reply);
    }

    #[test]
    fn client_reply_round_trips_without_leader_hint() {
        let reply = ClientReply {
            req_id: 1,
            status: ReplyStatus::Ok,
            leader_hint: None,
            data: b"ok".to_vec(),
        };
        let decoded = ClientReply::decode(&reply.encode().unwrap()).unwrap();
        assert_eq!(decoded.leader_hint, None);
    }

    #[test]
    fn heartbeat_round_trips() {
        let hb = Heartbeat {
            term: 9,
            leader_id: 1,
            commit: 100,
        };
        let decoded = Heartbeat::decode(&hb.encode().unwrap()).unwrap();
        assert_eq!(decoded, hb);
    }

    #[test]
    fn client_table_caches_and_invalidates_on_new_req_id() {
        let mut table = ClientTable::new();
        let reply = ClientReply {
            req_id: 1,
            status: ReplyStatus::Ok,
            leader_hint: None,
            data: b"v1".to_vec(),
        };
        table.record(5, 1, reply.clone());
        assert_eq!(table.cached_reply(5, 1), Some(&reply));
        assert_eq!(table.cached_reply(5, 2), None);
    }

    #[test]
    fn datagram_message_dispatches_by_leading_tag() {
        let hb = DatagramMessage::Heartbeat(Heartbeat {
            term: 1,
            leader_id: 0,
            commit: 0,
        });
        let encoded = hb.encode().unwrap();
        assert_eq!(DatagramMessage::decode(&encoded).unwrap(), hb);

        let vote = DatagramMessage::RequestVote(RequestVote {
            term: 2,
            candidate_id: 1,
        });
        assert_eq!(
            DatagramMessage::decode(&vote.encode().unwrap()).unwrap(),
            vote
        );
    }

    #[test]
    fn client_table_clear_drops_all_entries() {
        let mut table = ClientTable::new();
        table.record(
            1,
            1,
            ClientReply {
                req_id: 1,
                status: ReplyStatus::Ok,
                leader_hint: None,
                data: Vec::new(),
            },
        );
        table.clear();
        assert_eq!(table.cached_reply(1, 1), None);
    }
}
