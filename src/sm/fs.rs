use super::SmAdapter;
use crate::error::{DareError, DareResult};
use std::convert::TryInto;

const OP_READ: u8 = 0;
const OP_WRITE: u8 = 1;

/// A flat byte-arena stand-in for the original's file-backed state machine
/// (`SM_FS`). Real file I/O is out of scope here; this exercises the same
/// "apply a byte-range write/read against a growable backing store" shape
/// that `dare_sm.h`'s FS callbacks describe.
///
/// Command layout: `[op:u8][offset:u64][len:u16][data]` (`data` only
/// present for `write`).
#[derive(Debug, Default)]
pub struct FsSm {
    arena: Vec<u8>,
}

impl FsSm {
    pub fn new() -> FsSm {
        FsSm { arena: Vec::new() }
    }

    fn read_offset_len(cmd: &[u8]) -> DareResult<(u64, usize, &[u8])> {
        if cmd.len() < 10 {
            return Err(DareError::Encoding("truncated fs command header".into()));
        }
        let offset = u64::from_le_bytes(cmd[0..8].try_into().unwrap());
        let len = u16::from_le_bytes(cmd[8..10].try_into().unwrap()) as usize;
        Ok((offset, len, &cmd[10..]))
    }
}

impl SmAdapter for FsSm {
    fn apply_cmd(&mut self, cmd: &[u8]) -> DareResult<Vec<u8>> {
        if cmd.is_empty() {
            return Err(DareError::Encoding("empty fs command".into()));
        }
        let op = cmd[0];
        let (offset, len, rest) = FsSm::read_offset_len(&cmd[1..])?;
        let offset = offset as usize;
        match op {
            OP_READ => {
                let mut reply = vec![0u8; len];
                let avail = self.arena.len().saturating_sub(offset).min(len);
                if avail > 0 {
                    reply[..avail].copy_from_slice(&self.arena[offset..offset + avail]);
                }
                Ok(reply)
            }
            OP_WRITE => {
                if rest.len() < len {
                    return Err(DareError::Encoding("truncated fs write payload".into()));
                }
                let end = offset + len;
                if self.arena.len() < end {
                    self.arena.resize(end, 0);
                }
                self.arena[offset..end].copy_from_slice(&rest[..len]);
                Ok(Vec::new())
            }
            other => Err(DareError::Encoding(format!("unknown fs op {}", other))),
        }
    }

    fn size(&self) -> u32 {
        (4 + self.arena.len()) as u32
    }

    fn create_snapshot(&self, buf: &mut [u8]) -> DareResult<u32> {
        let needed = self.size() as usize;
        if buf.len() < needed {
            return Err(DareError::Encoding("snapshot buffer too small".into()));
        }
        buf[0..4].copy_from_slice(&(self.arena.len() as u32).to_le_bytes());
        buf[4..4 + self.arena.len()].copy_from_slice(&self.arena);
        Ok(needed as u32)
    }

    fn apply_snapshot(&mut self, buf: &[u8]) -> DareResult<()> {
        if buf.len() < 4 {
            return Err(DareError::Encoding("truncated fs snapshot".into()));
        }
        let len = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
        if buf.len() < 4 + len {
            return Err(DareError::Encoding("truncated fs snapshot body".into()));
        }
        self.arena = buf[4..4 + len].to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_cmd(offset: u64, data: &[u8]) -> Vec<u8> {
        let mut cmd = vec![OP_WRITE];
        cmd.extend_from_slice(&offset.to_le_bytes());
        cmd.extend_from_slice(&(data.len() as u16).to_le_bytes());
        cmd.extend_from_slice(data);
        cmd
    }

    fn read_cmd(offset: u64, len: u16) -> Vec<u8> {
        let mut cmd = vec![OP_READ];
        cmd.extend_from_slice(&offset.to_le_bytes());
        cmd.extend_from_slice(&len.to_le_bytes());
        cmd
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut sm = FsSm::new();
        sm.apply_cmd(&write_cmd(4, b"hello")).unwrap();
        let reply = sm.apply_cmd(&read_cmd(4, 5)).unwrap();
        assert_eq!(reply, b"hello");
    }

    #[test]
    fn read_past_written_range_is_zero_filled() {
        let mut sm = FsSm::new();
        sm.apply_cmd(&write_cmd(0, b"ab")).unwrap();
        let reply = sm.apply_cmd(&read_cmd(0, 4)).unwrap();
        assert_eq!(reply, vec![b'a', b'b', 0, 0]);
    }

    #[test]
    fn snapshot_round_trips_through_a_fresh_instance() {
        let mut sm = FsSm::new();
        sm.apply_cmd(&write_cmd(10, b"xyz")).unwrap();
        let mut buf = vec![0u8; sm.size() as usize];
        sm.create_snapshot(&mut buf).unwrap();

        let mut restored = FsSm::new();
        restored.apply_snapshot(&buf).unwrap();
        assert_eq!(restored.apply_cmd(&read_cmd(10, 3)).unwrap(), b"xyz");
    }
}
