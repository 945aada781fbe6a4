//! An in-process stand-in for the RDMA fabric, wiring every peer's
//! `RmaTransport`/`DatagramTransport` handle to shared memory and channels
//! instead of a real NIC. This is the only backend this crate ships; it
//! exists so the replication and election engines can be exercised without
//! an ibverbs-capable machine.

use super::{Completion, DatagramTransport, RmaTransport, WrId};
use crate::error::{DareError, DareResult};
use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};

/// Owns every peer's remote-writable memory region and datagram mailbox.
/// Call `handle` once per peer to obtain that peer's transport pair.
pub struct LoopbackFabric {
    regions: Vec<Arc<Mutex<Vec<u8>>>>,
    term_slots: Vec<Arc<Mutex<u64>>>,
    /// One pending corrective `end` push per peer, written by
    /// `write_remote_end` and consumed by that peer's own `take_pushed_end`
    /// -- the loopback analogue of a remote one-sided write landing in a
    /// dedicated metadata slot rather than the log buffer itself.
    end_slots: Vec<Arc<Mutex<Option<u64>>>>,
    datagram_senders: Vec<Sender<(u8, Vec<u8>)>>,
    datagram_receivers: Vec<Option<Receiver<(u8, Vec<u8>)>>>,
}

impl LoopbackFabric {
    pub fn new(peer_count: usize, region_len: usize) -> LoopbackFabric {
        let regions = (0..peer_count)
            .map(|_| Arc::new(Mutex::new(vec![0u8; region_len])))
            .collect();
        let term_slots = (0..peer_count).map(|_| Arc::new(Mutex::new(0u64))).collect();
        let end_slots = (0..peer_count).map(|_| Arc::new(Mutex::new(None))).collect();
        let mut datagram_senders = Vec::with_capacity(peer_count);
        let mut datagram_receivers = Vec::with_capacity(peer_count);
        for _ in 0..peer_count {
            let (tx, rx) = mpsc::channel();
            datagram_senders.push(tx);
            datagram_receivers.push(Some(rx));
        }
        LoopbackFabric {
            regions,
            term_slots,
            end_slots,
            datagram_senders,
            datagram_receivers,
        }
    }

    /// Builds the transport handles for peer `id`. Panics if called twice
    /// for the same id, since a datagram mailbox has exactly one owner.
    pub fn handle(&mut self, id: u8) -> (LoopbackRma, LoopbackDatagram) {
        let receiver = self.datagram_receivers[id as usize]
            .take()
            .expect("handle() called twice for the same peer id");
        let rma = LoopbackRma {
            conn: id,
            regions: self.regions.clone(),
            term_slots: self.term_slots.clone(),
            end_slots: self.end_slots.clone(),
            next_ssn: 0,
            completions: Vec::new(),
            read_results: HashMap::new(),
            term_results: HashMap::new(),
        };
        let datagram = LoopbackDatagram {
            conn: id,
            senders: self.datagram_senders.clone(),
            receiver,
        };
        (rma, datagram)
    }
}

pub struct LoopbackRma {
    conn: u8,
    regions: Vec<Arc<Mutex<Vec<u8>>>>,
    term_slots: Vec<Arc<Mutex<u64>>>,
    end_slots: Vec<Arc<Mutex<Option<u64>>>>,
    next_ssn: u64,
    completions: Vec<Completion>,
    read_results: HashMap<WrId, Vec<u8>>,
    term_results: HashMap<WrId, u64>,
}

impl LoopbackRma {
    fn next_wr_id(&mut self, signaled: bool) -> WrId {
        let ssn = self.next_ssn;
        self.next_ssn += 1;
        let mut wr_id = WrId::new(self.conn, ssn);
        if signaled {
            wr_id.set_tag();
        }
        wr_id
    }
}

impl RmaTransport for LoopbackRma {
    fn write_remote(&mut self, conn: u8, remote_offset: u64, data: &[u8], signaled: bool) -> DareResult<WrId> {
        let region = self
            .regions
            .get(conn as usize)
            .ok_or(DareError::PeerError(conn))?;
        let mut region = region.lock().unwrap();
        let start = remote_offset as usize;
        let end = start + data.len();
        if region.len() < end {
            region.resize(end, 0);
        }
        region[start..end].copy_from_slice(data);
        let wr_id = self.next_wr_id(signaled);
        self.completions.push(Completion {
            wr_id,
            success: true,
        });
        Ok(wr_id)
    }

    fn read_remote(&mut self, conn: u8, remote_offset: u64, len: u64, signaled: bool) -> DareResult<WrId> {
        let region = self
            .regions
            .get(conn as usize)
            .ok_or(DareError::PeerError(conn))?;
        let region = region.lock().unwrap();
        let start = remote_offset as usize;
        let end = start + len as usize;
        if region.len() < end {
            return Err(DareError::PeerError(conn));
        }
        let bytes = region[start..end].to_vec();
        let wr_id = self.next_wr_id(signaled);
        self.read_results.insert(wr_id, bytes);
        self.completions.push(Completion {
            wr_id,
            success: true,
        });
        Ok(wr_id)
    }

    fn write_remote_end(&mut self, conn: u8, end: u64) -> DareResult<WrId> {
        let slot = self
            .end_slots
            .get(conn as usize)
            .ok_or(DareError::PeerError(conn))?;
        *slot.lock().unwrap() = Some(end);
        let wr_id = self.next_wr_id(true);
        self.completions.push(Completion {
            wr_id,
            success: true,
        });
        Ok(wr_id)
    }

    fn take_pushed_end(&mut self) -> Option<u64> {
        let slot = &self.end_slots[self.conn as usize];
        slot.lock().unwrap().take()
    }

    fn poll_completions(&mut self) -> DareResult<Vec<Completion>> {
        Ok(std::mem::take(&mut self.completions))
    }

    fn take_read_result(&mut self, wr_id: WrId) -> Option<Vec<u8>> {
        self.read_results.remove(&wr_id)
    }

    fn sync_local_log(&mut self, log: &mut crate::log::Log) -> DareResult<()> {
        let region = self
            .regions
            .get(self.conn as usize)
            .ok_or(DareError::PeerError(self.conn))?;
        let region = region.lock().unwrap();
        let len = region.len().min(log.buf_len());
        log.splice(0, &region[..len]);
        Ok(())
    }

    fn publish_term(&mut self, term: u64) -> DareResult<()> {
        let slot = self
            .term_slots
            .get(self.conn as usize)
            .ok_or(DareError::PeerError(self.conn))?;
        *slot.lock().unwrap() = term;
        Ok(())
    }

    fn read_term(&mut self, conn: u8) -> DareResult<WrId> {
        let slot = self
            .term_slots
            .get(conn as usize)
            .ok_or(DareError::PeerError(conn))?;
        let term = *slot.lock().unwrap();
        let wr_id = self.next_wr_id();
        self.term_results.insert(wr_id, term);
        self.completions.push(Completion {
            wr_id,
            success: true,
        });
        Ok(wr_id)
    }

    fn take_term_result(&mut self, wr_id: WrId) -> Option<u64> {
        self.term_results.remove(&wr_id)
    }
}

pub struct LoopbackDatagram {
    conn: u8,
    senders: Vec<Sender<(u8, Vec<u8>)>>,
    receiver: Receiver<(u8, Vec<u8>)>,
}

impl DatagramTransport for LoopbackDatagram {
    fn send_to(&mut self, conn: u8, data: &[u8]) -> DareResult<()> {
        let sender = self
            .senders
            .get(conn as usize)
            .ok_or(DareError::PeerError(conn))?;
        sender
            .send((self.conn, data.to_vec()))
            .map_err(|_| DareError::PeerError(conn))
    }

    fn try_recv(&mut self) -> DareResult<Option<(u8, Vec<u8>)>> {
        match self.receiver.try_recv() {
            Ok(msg) => Ok(Some(msg)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips_across_handles() {
        let mut fabric = LoopbackFabric::new(2, 1024);
        let (mut rma0, _dg0) = fabric.handle(0);
        let (mut rma1, _dg1) = fabric.handle(1);

        rma0.write_remote(1, 16, b"hello", true).unwrap();
        let completions = rma0.poll_completions().unwrap();
        assert_eq!(completions.len(), 1);
        assert!(completions[0].success);

        let wr_id = rma1.read_remote(1, 16, 5, true).unwrap();
        rma1.poll_completions().unwrap();
        assert_eq!(rma1.take_read_result(wr_id).unwrap(), b"hello");
    }

    #[test]
    fn datagrams_are_tagged_with_the_sender_and_delivered_once() {
        let mut fabric = LoopbackFabric::new(2, 64);
        let (_rma0, mut dg0) = fabric.handle(0);
        let (_rma1, mut dg1) = fabric.handle(1);

        dg0.send_to(1, b"vote-request").unwrap();
        let (from, payload) = dg1.try_recv().unwrap().unwrap();
        assert_eq!(from, 0);
        assert_eq!(payload, b"vote-request");
        assert!(dg1.try_recv().unwrap().is_none());
    }

    #[test]
    #[should_panic]
    fn handle_cannot_be_taken_twice_for_the_same_peer() {
        let mut fabric = LoopbackFabric::new(2, 64);
        let _ = fabric.handle(0);
        let _ = fabric.handle(0);
    }

    #[test]
    fn only_signaled_writes_tag_their_wr_id() {
        let mut fabric = LoopbackFabric::new(2, 1024);
        let (mut rma0, _dg0) = fabric.handle(0);

        let unsignaled = rma0.write_remote(1, 0, b"a", false).unwrap();
        let signaled = rma0.write_remote(1, 1, b"b", true).unwrap();
        assert!(!unsignaled.tag());
        assert!(signaled.tag());
    }

    #[test]
    fn pushed_end_is_observed_once_by_the_targeted_peer() {
        let mut fabric = LoopbackFabric::new(2, 64);
        let (mut rma0, _dg0) = fabric.handle(0);
        let (mut rma1, _dg1) = fabric.handle(1);

        assert_eq!(rma1.take_pushed_end(), None);
        rma0.write_remote_end(1, 42).unwrap();
        assert_eq!(rma1.take_pushed_end(), Some(42));
        assert_eq!(rma1.take_pushed_end(), None);
    }
}
