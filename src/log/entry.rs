use crate::error::{DareError, DareResult};
use std::convert::TryInto;

/// `idx`, `term`, `req_id`, `clt_id`, `type` -- see spec.md §3. The header
/// is fixed-size and padded to 32 bytes so it lands on a RMA-friendly
/// word boundary; peers never observe a torn header because it is written
/// as a single contiguous remote write and the payload is only trusted once
/// the header write's completion has been observed.
pub const HEADER_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    Noop,
    Csm,
    Config,
    Head,
}

impl EntryType {
    fn to_u8(self) -> u8 {
        match self {
            EntryType::Noop => 0,
            EntryType::Csm => 1,
            EntryType::Config => 2,
            EntryType::Head => 3,
        }
    }

    fn from_u8(b: u8) -> DareResult<EntryType> {
        match b {
            0 => Ok(EntryType::Noop),
            1 => Ok(EntryType::Csm),
            2 => Ok(EntryType::Config),
            3 => Ok(EntryType::Head),
            other => Err(DareError::Encoding(format!("unknown entry type tag {}", other))),
        }
    }
}

/// A peer's active-set/size/epoch triple, carried by a CONFIG entry.
/// `active` is a bit-vector, one bit per peer index (0..=63), so
/// `MAX_SERVER_COUNT` is capped at 64 -- a generous bound given the
/// original's 8-bit peer index (`WRID_GET_CONN`) in
/// `comparison/DARE/include/dare_ibv_rc.h`.
pub const CONFIG_ID_LEN: usize = 17;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigId {
    pub group_size: u8,
    pub active: u64,
    pub epoch: u64,
}

impl ConfigId {
    pub fn is_active(&self, peer_idx: u8) -> bool {
        peer_idx < 64 && (self.active & (1u64 << peer_idx)) != 0
    }

    fn encode(&self, out: &mut [u8]) {
        out[0] = self.group_size;
        out[1..9].copy_from_slice(&self.active.to_le_bytes());
        out[9..17].copy_from_slice(&self.epoch.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> DareResult<ConfigId> {
        if buf.len() < CONFIG_ID_LEN {
            return Err(DareError::Encoding("truncated CONFIG payload".into()));
        }
        Ok(ConfigId {
            group_size: buf[0],
            active: u64::from_le_bytes(buf[1..9].try_into().unwrap()),
            epoch: u64::from_le_bytes(buf[9..17].try_into().unwrap()),
        })
    }
}

/// Type-dependent payload of a log entry, decoded from the bytes following
/// the fixed header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Noop,
    Csm(Vec<u8>),
    Config(ConfigId),
    Head(u64),
}

/// A fully decoded log entry: header fields plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub idx: u64,
    pub term: u64,
    pub req_id: u64,
    pub clt_id: u16,
    pub payload: Payload,
}

impl Entry {
    pub fn entry_type(&self) -> EntryType {
        match &self.payload {
            Payload::Noop => EntryType::Noop,
            Payload::Csm(_) => EntryType::Csm,
            Payload::Config(_) => EntryType::Config,
            Payload::Head(_) => EntryType::Head,
        }
    }

    /// Total on-the-wire length of this entry: header plus payload.
    pub fn byte_len(&self) -> usize {
        HEADER_LEN
            + match &self.payload {
                Payload::Noop => 0,
                Payload::Csm(bytes) => 2 + bytes.len(),
                Payload::Config(_) => CONFIG_ID_LEN,
                Payload::Head(_) => 8,
            }
    }

    /// Writes this entry's header + payload into `out`, which must be at
    /// least `byte_len()` bytes.
    pub fn encode_into(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= self.byte_len());
        out[0..8].copy_from_slice(&self.idx.to_le_bytes());
        out[8..16].copy_from_slice(&self.term.to_le_bytes());
        out[16..24].copy_from_slice(&self.req_id.to_le_bytes());
        out[24..26].copy_from_slice(&self.clt_id.to_le_bytes());
        out[26] = self.entry_type().to_u8();
        // out[27..32] is padding; left zeroed.
        for b in &mut out[27..HEADER_LEN] {
            *b = 0;
        }
        let body = &mut out[HEADER_LEN..];
        match &self.payload {
            Payload::Noop => {}
            Payload::Csm(bytes) => {
                let len = bytes.len() as u16;
                body[0..2].copy_from_slice(&len.to_le_bytes());
                body[2..2 + bytes.len()].copy_from_slice(bytes);
            }
            Payload::Config(cid) => cid.encode(&mut body[0..CONFIG_ID_LEN]),
            Payload::Head(offset) => body[0..8].copy_from_slice(&offset.to_le_bytes()),
        }
    }

    /// Reads just the fixed header fields (idx, term, type) out of `buf`
    /// without touching the payload.
    pub(crate) fn peek_header(buf: &[u8]) -> DareResult<(u64, u64, u64, u16, EntryType)> {
        if buf.len() < HEADER_LEN {
            return Err(DareError::Encoding("truncated entry header".into()));
        }
        let idx = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let term = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        let req_id = u64::from_le_bytes(buf[16..24].try_into().unwrap());
        let clt_id = u16::from_le_bytes(buf[24..26].try_into().unwrap());
        let ty = EntryType::from_u8(buf[26])?;
        Ok((idx, term, req_id, clt_id, ty))
    }

    /// Fully decodes an entry (header + payload) from `buf`.
    pub(crate) fn decode(buf: &[u8]) -> DareResult<Entry> {
        let (idx, term, req_id, clt_id, ty) = Entry::peek_header(buf)?;
        let body = &buf[HEADER_LEN..];
        let payload = match ty {
            EntryType::Noop => Payload::Noop,
            EntryType::Csm => {
                if body.len() < 2 {
                    return Err(DareError::Encoding("truncated CSM length prefix".into()));
                }
                let len = u16::from_le_bytes(body[0..2].try_into().unwrap()) as usize;
                if body.len() < 2 + len {
                    return Err(DareError::Encoding("truncated CSM payload".into()));
                }
                Payload::Csm(body[2..2 + len].to_vec())
            }
            EntryType::Config => Payload::Config(ConfigId::decode(body)?),
            EntryType::Head => {
                if body.len() < 8 {
                    return Err(DareError::Encoding("truncated HEAD payload".into()));
                }
                Payload::Head(u64::from_le_bytes(body[0..8].try_into().unwrap()))
            }
        };
        Ok(Entry {
            idx,
            term,
            req_id,
            clt_id,
            payload,
        })
    }

}

/// `(idx, term, offset)` -- uniquely identifies an entry's position. Used
/// by the NC-buffer and by `find_remote_end` during log adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Determinant {
    pub idx: u64,
    pub term: u64,
    pub offset: u64,
}
