use crate::log::entry::Determinant;
use std::convert::TryInto;

/// Per-peer capacity of the not-committed-entries buffer (§3). The leader
/// refuses appends that would push the tracked not-committed range past
/// this, so it is never exceeded in practice.
pub const MAX_NC_ENTRIES: usize = 1024;

/// Not-Committed-Entries buffer: a compact `(idx, term, offset)` list for
/// every entry between `commit` and `end`. Rebuilt locally before serving an
/// adjustment read, and read remotely by a server that just became leader
/// (§4.1 `build_nc_buffer`, §4.5).
#[derive(Debug, Clone, Default)]
pub struct NcBuffer {
    entries: Vec<Determinant>,
}

impl NcBuffer {
    pub fn new() -> NcBuffer {
        NcBuffer {
            entries: Vec::with_capacity(MAX_NC_ENTRIES),
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= MAX_NC_ENTRIES
    }

    pub fn push(&mut self, det: Determinant) -> bool {
        if self.is_full() {
            return false;
        }
        self.entries.push(det);
        true
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Determinant> {
        self.entries.iter()
    }

    /// Serializes this NC-buffer into a flat byte buffer so it can be
    /// transferred by a one-sided remote read (§4.5 step 2): a `u64` count
    /// followed by that many `(idx, term, offset)` 24-byte determinants.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.entries.len() * 24);
        out.extend_from_slice(&(self.entries.len() as u64).to_le_bytes());
        for det in &self.entries {
            out.extend_from_slice(&det.idx.to_le_bytes());
            out.extend_from_slice(&det.term.to_le_bytes());
            out.extend_from_slice(&det.offset.to_le_bytes());
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Option<NcBuffer> {
        if buf.len() < 8 {
            return None;
        }
        let len = u64::from_le_bytes(buf[0..8].try_into().ok()?) as usize;
        if len > MAX_NC_ENTRIES || buf.len() < 8 + len * 24 {
            return None;
        }
        let mut entries = Vec::with_capacity(len);
        for i in 0..len {
            let base = 8 + i * 24;
            let idx = u64::from_le_bytes(buf[base..base + 8].try_into().ok()?);
            let term = u64::from_le_bytes(buf[base + 8..base + 16].try_into().ok()?);
            let offset = u64::from_le_bytes(buf[base + 16..base + 24].try_into().ok()?);
            entries.push(Determinant { idx, term, offset });
        }
        Some(NcBuffer { entries })
    }
}
