//! The circular byte log (spec.md §3, §4.1): a contiguous region of size
//! `L`, registered with the transport so peers can write into it, tracked
//! by four offsets (`head <= apply <= commit <= end`, modulo wrap-around)
//! plus a resettable `tail` cache. Variable-length entries and RMA-friendly
//! byte writes rule out a fixed slot array (see DESIGN.md); every operation
//! that touches an offset lives in this module so raw offsets never leak to
//! callers as something they do arithmetic on themselves.

mod entry;
mod nc_buffer;

pub use entry::{ConfigId, Entry, EntryType, Payload, CONFIG_ID_LEN, HEADER_LEN};
pub use nc_buffer::{NcBuffer, MAX_NC_ENTRIES};

use crate::error::{DareError, DareResult};
pub use entry::Determinant;

/// Default log region size: 16 MiB, the same order of magnitude as the
/// original's `LOG_SIZE (16384*PAGE_SIZE)`.
pub const DEFAULT_LOG_SIZE: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Offsets {
    pub head: u64,
    pub apply: u64,
    pub commit: u64,
    pub end: u64,
}

/// The circular log itself. `buf` is the registered memory region; `len`
/// is its size (`L`). A new leader's remote writes land directly in a
/// peer's `buf` at the same byte offsets the leader uses locally -- see
/// `server::replication`.
pub struct Log {
    buf: Vec<u8>,
    len: u64,
    head: u64,
    apply: u64,
    commit: u64,
    end: u64,
    tail: u64,
    /// Count of entries between `commit` and `end`. Tracked incrementally
    /// so `append` can refuse once the not-committed range would overflow
    /// the NC-buffer capacity, without rebuilding the buffer on every call.
    not_committed_count: usize,
}

impl Log {
    pub fn new(len: u64) -> Log {
        Log {
            buf: vec![0u8; len as usize],
            len,
            head: 0,
            apply: 0,
            commit: 0,
            end: len,
            tail: len,
            not_committed_count: 0,
        }
    }

    pub fn with_default_size() -> Log {
        Log::new(DEFAULT_LOG_SIZE)
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn offsets(&self) -> Offsets {
        Offsets {
            head: self.head,
            apply: self.apply,
            commit: self.commit,
            end: self.end,
        }
    }

    pub fn head(&self) -> u64 {
        self.head
    }
    pub fn apply_offset(&self) -> u64 {
        self.apply
    }
    pub fn commit_offset(&self) -> u64 {
        self.commit
    }
    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.len
    }

    pub fn is_full(&self) -> bool {
        self.end == self.head
    }

    pub fn has_uncommitted_entries(&self) -> bool {
        !self.is_empty() && self.commit != self.end
    }

    pub fn has_unapplied_entries(&self) -> bool {
        !self.is_empty() && self.apply != self.commit
    }

    /// Circular distance from `head` to `apply`: how many applied bytes are
    /// sitting between the retained head and the next not-yet-applied
    /// entry, not yet reclaimed by a HEAD entry (§4.3 "If apply - head >
    /// threshold"). Zero once the log is empty.
    pub fn unreclaimed_len(&self) -> u64 {
        if self.is_empty() {
            return 0;
        }
        if self.apply >= self.head {
            self.apply - self.head
        } else {
            self.len - self.head + self.apply
        }
    }

    fn fits_header_at(&self, offset: u64) -> bool {
        self.len - offset >= HEADER_LEN as u64
    }

    /// Bytes available from `start` forward before the circular buffer
    /// would run into `head` -- the bound `append` has to respect once the
    /// log has wrapped, so a burst of appends between two HEAD entries can
    /// never silently overwrite log space a follower or the state machine
    /// hasn't caught up to yet. The log's initial empty state has no
    /// meaningful `head` relative to a written entry yet, so the whole
    /// buffer counts as free.
    fn room_until_head(&self, start: u64) -> u64 {
        if self.is_empty() {
            return self.len;
        }
        if self.head > start {
            self.head - start
        } else if self.head < start {
            self.len - start + self.head
        } else {
            0
        }
    }

    /// Raw byte access to the region backing `[offset, offset+len)`. Used by
    /// the transport layer to copy bytes out for a remote write; never
    /// wraps across `L` on its own -- callers split wrapping ranges into
    /// two calls (§4.2 "Handle wrap by issuing two writes").
    pub fn bytes(&self, offset: u64, len: u64) -> &[u8] {
        &self.buf[offset as usize..(offset + len) as usize]
    }

    pub fn bytes_mut(&mut self, offset: u64, len: u64) -> &mut [u8] {
        &mut self.buf[offset as usize..(offset + len) as usize]
    }

    pub fn buf_len(&self) -> usize {
        self.buf.len()
    }

    /// Circular distance from `offset` to `end`; 0 once the log is empty.
    fn offset_end_distance(&self, offset: u64) -> u64 {
        let end = self.end;
        if end == self.len {
            return 0;
        }
        if end >= offset {
            end - offset
        } else {
            self.len - (offset - end)
        }
    }

    /// True iff `a` is closer to `end` than `b` -- the one true "later"
    /// comparison across a wrapping buffer (§4.1).
    pub fn is_larger(&self, a: u64, b: u64) -> bool {
        self.offset_end_distance(a) < self.offset_end_distance(b)
    }

    /// Returns the entry header pointer (here: the resolved offset plus
    /// decoded entry) at `offset`, auto-wrapping to 0 first if a header
    /// wouldn't fit there. `None` if the log is empty or `offset == end`.
    pub fn entry_at(&self, offset: u64) -> DareResult<Option<(u64, Entry)>> {
        if self.is_empty() {
            return Ok(None);
        }
        if self.offset_end_distance(offset) == 0 {
            return Ok(None);
        }
        let resolved = if !self.fits_header_at(offset) { 0 } else { offset };
        let entry = Entry::decode(&self.buf[resolved as usize..])?;
        Ok(Some((resolved, entry)))
    }

    /// Advances past `entry` (assumed to start at `offset`), wrapping to 0
    /// if the landing position couldn't hold another header.
    pub fn next_offset(&self, offset: u64, entry: &Entry) -> u64 {
        let advanced = offset + entry.byte_len() as u64;
        debug_assert!(advanced <= self.len);
        if self.len - advanced < HEADER_LEN as u64 {
            0
        } else {
            advanced
        }
    }

    /// Appends a new entry to the log. Leader-only. Returns the new
    /// entry's `idx`, or `DareError::LogFull` if the log (or the NC-buffer
    /// that tracks its not-committed tail) has no room.
    pub fn append(
        &mut self,
        term: u64,
        req_id: u64,
        clt_id: u16,
        payload: Payload,
    ) -> DareResult<u64> {
        if self.is_full() {
            return Err(DareError::LogFull);
        }
        if self.not_committed_count >= MAX_NC_ENTRIES {
            return Err(DareError::LogFull);
        }
        if self.tail == self.len {
            self.recompute_tail();
        }
        let idx = match self.entry_at(self.tail)? {
            Some((_, last)) => last.idx + 1,
            None => 1,
        };

        let entry = Entry {
            idx,
            term,
            req_id,
            clt_id,
            payload,
        };
        let entry_len = entry.byte_len() as u64;

        let mut start = self.end;
        if !self.fits_header_at(start) {
            start = 0;
        }
        if matches!(entry.payload, Payload::Csm(_)) && self.len - start < entry_len {
            // The header fit, but the (variable-length) CSM payload
            // doesn't -- redo the allocation from 0, discarding the
            // stranded header slot (§4.1: "If a CSM payload doesn't fit
            // after the header before L, re-does the allocation at offset
            // 0"). CONFIG/HEAD/NOOP payloads are small and fixed-size, so a
            // fitting header is trusted to mean a fitting entry.
            start = 0;
        }
        if self.len - start < entry_len {
            // Even a fresh buffer can't hold this entry.
            return Err(DareError::LogFull);
        }
        if entry_len > self.room_until_head(start) {
            // Fits in the buffer physically, but would write past `head`
            // into log space nothing has reclaimed yet.
            return Err(DareError::LogFull);
        }

        entry.encode_into(&mut self.buf[start as usize..(start as u64 + entry_len) as usize]);
        self.tail = start;
        self.end = start + entry_len;
        self.not_committed_count += 1;

        Ok(idx)
    }

    /// Recomputes `tail` by scanning forward from `commit`, then `apply`,
    /// then `head` until an entry can no longer be found (§4.1). Called
    /// after a leadership gain, since `tail` is reset to `len` on loss of
    /// leadership.
    pub fn recompute_tail(&mut self) {
        if self.is_empty() {
            self.tail = self.len;
            return;
        }
        for start in [self.commit, self.apply, self.head] {
            if let Some(t) = self.scan_to_tail(start) {
                self.tail = t;
                return;
            }
        }
        self.tail = self.len;
    }

    fn scan_to_tail(&self, start: u64) -> Option<u64> {
        let mut offset = start;
        let mut tail = None;
        while let Ok(Some((off, entry))) = self.entry_at(offset) {
            tail = Some(off);
            offset = self.next_offset(off, &entry);
        }
        tail
    }

    /// Rebuilds the NC-buffer from `commit` to `end` (§4.1). Called before
    /// serving an adjustment read from a new leader.
    pub fn build_nc_buffer(&self, out: &mut NcBuffer) -> DareResult<()> {
        out.clear();
        let mut offset = self.commit;
        while let Some((off, entry)) = self.entry_at(offset)? {
            if !out.push(Determinant {
                idx: entry.idx,
                term: entry.term,
                offset: off,
            }) {
                break;
            }
            offset = self.next_offset(off, &entry);
        }
        Ok(())
    }

    /// Leader-side log-matching (§4.5): walks `remote_nc`'s determinants in
    /// order, comparing each against what the *local* log holds at that
    /// offset. Returns the first offset at which the local log is missing
    /// the entry or disagrees on `(idx, term)` -- the point from which the
    /// leader must start overwriting the follower's log. `remote_commit`
    /// seeds the scan so an empty `remote_nc` (follower already caught up
    /// to its own commit) still resolves to a sane answer instead of the
    /// original C function's undefined behavior on an empty buffer.
    pub fn find_remote_end(&self, remote_nc: &NcBuffer, remote_commit: u64) -> DareResult<u64> {
        let mut offset = remote_commit;
        for det in remote_nc.iter() {
            offset = det.offset;
            match self.entry_at(offset)? {
                None => return Ok(offset),
                Some((resolved, entry)) => {
                    if entry.idx != det.idx || entry.term != det.term {
                        return Ok(resolved);
                    }
                    offset = self.next_offset(resolved, &entry);
                }
            }
        }
        Ok(offset)
    }

    /// Discards entries before `new_head`. Only called after a HEAD entry
    /// has committed and been applied.
    pub fn advance_head(&mut self, new_head: u64) {
        self.head = new_head;
    }

    /// Resets `tail` to `len`, invalidating the cache. Called on loss of
    /// leadership (§3).
    pub fn invalidate_tail(&mut self) {
        self.tail = self.len;
    }

    /// Advances `commit` to `new_commit` and refreshes the not-committed
    /// entry count used by `append`'s backpressure check.
    pub fn advance_commit(&mut self, new_commit: u64) -> DareResult<()> {
        self.commit = new_commit;
        let mut scratch = NcBuffer::new();
        self.build_nc_buffer(&mut scratch)?;
        self.not_committed_count = scratch.len();
        Ok(())
    }

    /// Advances `apply` past the entry at `offset` (post-apply bookkeeping,
    /// §4.3).
    pub fn advance_apply(&mut self, new_apply: u64) {
        self.apply = new_apply;
    }

    /// Overwrites the follower's region `[dst_offset, dst_offset+len)` with
    /// raw bytes, used by the replication engine to mirror a remote write
    /// locally for the loopback transport's benefit and by recovery code
    /// restoring from a snapshot transfer. Leader-driven overwrite has no
    /// per-entry acknowledgement -- whatever lands in the registered region
    /// is accepted (§4.2 "Remote-log truncation").
    pub fn splice(&mut self, dst_offset: u64, bytes: &[u8]) {
        let end = dst_offset as usize + bytes.len();
        self.buf[dst_offset as usize..end].copy_from_slice(bytes);
    }

    /// Forcibly sets `end` (used when a remote write sets this follower's
    /// end, and by log adjustment truncating a follower via
    /// `server::adjust`).
    pub fn set_end(&mut self, end: u64) {
        self.end = end;
    }

    pub fn set_offsets(&mut self, offsets: Offsets) {
        self.head = offsets.head;
        self.apply = offsets.apply;
        self.commit = offsets.commit;
        self.end = offsets.end;
    }

    /// Advances `end` as far as the backing buffer actually holds
    /// successfully-decodable entries beyond its current position, instead
    /// of trusting any externally claimed offset. `append` never produces
    /// an entry with `idx == 0`, so decoding one at the next candidate
    /// offset means nothing has landed there yet rather than a genuine
    /// entry -- this is how a follower derives its own high-water mark from
    /// the RMA-written log itself (§4.4: heartbeats are advisory, not the
    /// source of truth for log contents). Bounded by `MAX_NC_ENTRIES` hops,
    /// the same cap the leader enforces on its own not-committed tail.
    pub fn sync_end_from_content(&mut self) {
        let mut offset = if self.is_empty() { 0 } else { self.end };
        for _ in 0..MAX_NC_ENTRIES {
            let resolved = if !self.fits_header_at(offset) { 0 } else { offset };
            let entry = match Entry::decode(&self.buf[resolved as usize..]) {
                Ok(entry) => entry,
                Err(_) => break,
            };
            if entry.idx == 0 {
                break;
            }
            offset = self.next_offset(resolved, &entry);
            self.end = offset;
        }
    }

    #[cfg(test)]
    pub(crate) fn raw_buf(&self) -> &[u8] {
        &self.buf
    }
}

#[cfg(test)]
pub mod mocks {
    use super::*;
    use rand::Rng;

    pub fn random_payload_bytes(len: usize) -> Vec<u8> {
        let mut rng = rand::thread_rng();
        (0..len).map(|_| rng.gen()).collect()
    }

    /// A small log (64 KiB) suitable for fast, deterministic unit tests.
    pub fn new_test_log() -> Log {
        Log::new(64 * 1024)
    }

    /// Appends `count` CSM entries of `payload_len` bytes each, all in
    /// `term`, returning their indices.
    pub fn append_n_csm(log: &mut Log, term: u64, count: usize, payload_len: usize) -> Vec<u64> {
        (0..count)
            .map(|i| {
                log.append(
                    term,
                    i as u64,
                    0,
                    Payload::Csm(random_payload_bytes(payload_len)),
                )
                .expect("append should succeed in test fixture")
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_starts_at_idx_one_and_increments() {
        let mut log = mocks::new_test_log();
        let i1 = log.append(1, 0, 0, Payload::Noop).unwrap();
        let i2 = log.append(1, 1, 0, Payload::Noop).unwrap();
        let i3 = log.append(1, 2, 0, Payload::Csm(vec![1, 2, 3])).unwrap();
        assert_eq!(i1, 1);
        assert_eq!(i2, 2);
        assert_eq!(i3, 3);
    }

    #[test]
    fn entry_at_round_trips_payload() {
        let mut log = mocks::new_test_log();
        log.append(7, 42, 9, Payload::Csm(vec![9, 8, 7, 6])).unwrap();
        let (off, entry) = log.entry_at(0).unwrap().unwrap();
        assert_eq!(off, 0);
        assert_eq!(entry.idx, 1);
        assert_eq!(entry.term, 7);
        assert_eq!(entry.req_id, 42);
        assert_eq!(entry.clt_id, 9);
        assert_eq!(entry.payload, Payload::Csm(vec![9, 8, 7, 6]));
    }

    #[test]
    fn entry_at_end_is_none() {
        let mut log = mocks::new_test_log();
        log.append(1, 0, 0, Payload::Noop).unwrap();
        let end = log.end();
        assert!(log.entry_at(end).unwrap().is_none());
    }

    #[test]
    fn next_offset_wraps_when_landing_cannot_hold_header() {
        let log = Log::new(HEADER_LEN as u64 + 8 + 10);
        let entry = Entry {
            idx: 1,
            term: 1,
            req_id: 0,
            clt_id: 0,
            payload: Payload::Head(5),
        };
        // byte_len() == HEADER_LEN + 8; landing position has only 10 bytes
        // left, not enough for another header, so it wraps to 0.
        assert_eq!(log.next_offset(0, &entry), 0);
    }

    #[test]
    fn is_full_when_end_equals_head() {
        let mut log = mocks::new_test_log();
        assert!(!log.is_full()); // empty, end == len
        log.set_offsets(Offsets {
            head: 100,
            apply: 100,
            commit: 100,
            end: 100,
        });
        assert!(log.is_full());
        assert!(matches!(
            log.append(1, 1, 0, Payload::Noop),
            Err(DareError::LogFull)
        ));
    }

    #[test]
    fn is_larger_orders_by_distance_to_end() {
        let mut log = mocks::new_test_log();
        log.append(1, 0, 0, Payload::Noop).unwrap(); // idx 1, offset 0
        log.append(1, 1, 0, Payload::Noop).unwrap(); // idx 2
        log.append(1, 2, 0, Payload::Noop).unwrap(); // idx 3
        // offset of idx 3 is closer to end than offset of idx 1.
        let off1 = 0u64;
        let off3 = 2 * HEADER_LEN as u64;
        assert!(log.is_larger(off3, off1));
        assert!(!log.is_larger(off1, off3));
    }

    #[test]
    fn build_nc_buffer_covers_commit_to_end() {
        let mut log = mocks::new_test_log();
        log.append(1, 0, 0, Payload::Noop).unwrap();
        log.append(1, 1, 0, Payload::Noop).unwrap();
        log.append(1, 2, 0, Payload::Noop).unwrap();
        let mut nc = NcBuffer::new();
        log.build_nc_buffer(&mut nc).unwrap();
        assert_eq!(nc.len(), 3);
    }

    #[test]
    fn find_remote_end_detects_divergence() {
        let mut leader = mocks::new_test_log();
        leader.append(1, 0, 0, Payload::Noop).unwrap();
        leader.append(1, 1, 0, Payload::Noop).unwrap();
        leader.append(2, 2, 0, Payload::Noop).unwrap(); // term bumps on entry 3

        let mut follower = mocks::new_test_log();
        follower.append(1, 0, 0, Payload::Noop).unwrap();
        follower.append(1, 1, 0, Payload::Noop).unwrap();
        follower.append(1, 2, 0, Payload::Noop).unwrap(); // stale term 1, not 2

        let mut follower_nc = NcBuffer::new();
        follower.build_nc_buffer(&mut follower_nc).unwrap();

        let m = leader
            .find_remote_end(&follower_nc, follower.commit_offset())
            .unwrap();
        // The mismatch is the third entry, which starts at 2*HEADER_LEN.
        assert_eq!(m, 2 * HEADER_LEN as u64);
    }

    #[test]
    fn find_remote_end_with_empty_nc_falls_back_to_commit() {
        let log = mocks::new_test_log();
        let nc = NcBuffer::new();
        assert_eq!(log.find_remote_end(&nc, 123).unwrap(), 123);
    }

    #[test]
    fn sync_end_from_content_advances_past_decodable_entries_only() {
        let mut leader = mocks::new_test_log();
        leader.append(1, 0, 0, Payload::Noop).unwrap();
        leader.append(1, 1, 0, Payload::Noop).unwrap();
        let leader_end = leader.end();

        // A follower whose buffer received the same bytes but whose own
        // offsets haven't been told about them yet.
        let mut follower = Log::new(leader.len());
        follower.splice(0, leader.raw_buf());
        follower.set_offsets(Offsets {
            head: 0,
            apply: 0,
            commit: 0,
            end: 0,
        });

        follower.sync_end_from_content();
        assert_eq!(follower.end(), leader_end);

        // Calling it again once truly caught up is a no-op: the next
        // candidate offset is still zeroed, untouched memory.
        follower.sync_end_from_content();
        assert_eq!(follower.end(), leader_end);
    }

    #[test]
    fn advance_commit_tracks_not_committed_count() {
        let mut log = mocks::new_test_log();
        log.append(1, 0, 0, Payload::Noop).unwrap();
        log.append(1, 1, 0, Payload::Noop).unwrap();
        assert_eq!(log.not_committed_count, 2);
        let new_commit = HEADER_LEN as u64;
        log.advance_commit(new_commit).unwrap();
        assert_eq!(log.not_committed_count, 1);
    }
}
