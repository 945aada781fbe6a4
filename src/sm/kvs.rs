use super::SmAdapter;
use crate::error::{DareError, DareResult};
use std::collections::HashMap;
use std::convert::TryInto;

const OP_GET: u8 = 0;
const OP_PUT: u8 = 1;
const OP_DELETE: u8 = 2;

/// An in-memory key/value store, the Rust analogue of `create_kvs_sm`.
/// Commands are a small self-describing wire format rather than the
/// original's fixed-size hash-table slots, since Rust gives us a growable
/// `HashMap` for free.
///
/// Command layout: `[op:u8][key_len:u16][key][value_len:u16][value]`
/// (`value_len`/`value` only present for `put`).
#[derive(Debug, Default)]
pub struct KvsSm {
    table: HashMap<Vec<u8>, Vec<u8>>,
}

impl KvsSm {
    pub fn new() -> KvsSm {
        KvsSm {
            table: HashMap::new(),
        }
    }

    fn read_key(cmd: &[u8]) -> DareResult<(&[u8], &[u8])> {
        if cmd.len() < 2 {
            return Err(DareError::Encoding("truncated kvs key length".into()));
        }
        let key_len = u16::from_le_bytes(cmd[0..2].try_into().unwrap()) as usize;
        if cmd.len() < 2 + key_len {
            return Err(DareError::Encoding("truncated kvs key".into()));
        }
        Ok((&cmd[2..2 + key_len], &cmd[2 + key_len..]))
    }
}

impl SmAdapter for KvsSm {
    fn apply_cmd(&mut self, cmd: &[u8]) -> DareResult<Vec<u8>> {
        if cmd.is_empty() {
            return Err(DareError::Encoding("empty kvs command".into()));
        }
        let op = cmd[0];
        let (key, rest) = KvsSm::read_key(&cmd[1..])?;
        match op {
            OP_GET => match self.table.get(key) {
                Some(value) => {
                    let mut reply = Vec::with_capacity(1 + value.len());
                    reply.push(1);
                    reply.extend_from_slice(value);
                    Ok(reply)
                }
                None => Ok(vec![0]),
            },
            OP_PUT => {
                if rest.len() < 2 {
                    return Err(DareError::Encoding("truncated kvs value length".into()));
                }
                let value_len = u16::from_le_bytes(rest[0..2].try_into().unwrap()) as usize;
                if rest.len() < 2 + value_len {
                    return Err(DareError::Encoding("truncated kvs value".into()));
                }
                self.table
                    .insert(key.to_vec(), rest[2..2 + value_len].to_vec());
                Ok(Vec::new())
            }
            OP_DELETE => {
                self.table.remove(key);
                Ok(Vec::new())
            }
            other => Err(DareError::Encoding(format!("unknown kvs op {}", other))),
        }
    }

    fn size(&self) -> u32 {
        let body: usize = self
            .table
            .iter()
            .map(|(k, v)| 2 + k.len() + 4 + v.len())
            .sum();
        (4 + body) as u32
    }

    fn create_snapshot(&self, buf: &mut [u8]) -> DareResult<u32> {
        let needed = self.size() as usize;
        if buf.len() < needed {
            return Err(DareError::Encoding("snapshot buffer too small".into()));
        }
        let mut off = 0;
        buf[0..4].copy_from_slice(&(self.table.len() as u32).to_le_bytes());
        off += 4;
        for (key, value) in &self.table {
            buf[off..off + 2].copy_from_slice(&(key.len() as u16).to_le_bytes());
            off += 2;
            buf[off..off + key.len()].copy_from_slice(key);
            off += key.len();
            buf[off..off + 4].copy_from_slice(&(value.len() as u32).to_le_bytes());
            off += 4;
            buf[off..off + value.len()].copy_from_slice(value);
            off += value.len();
        }
        Ok(off as u32)
    }

    fn apply_snapshot(&mut self, buf: &[u8]) -> DareResult<()> {
        if buf.len() < 4 {
            return Err(DareError::Encoding("truncated kvs snapshot".into()));
        }
        let count = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
        let mut table = HashMap::with_capacity(count);
        let mut off = 4;
        for _ in 0..count {
            if buf.len() < off + 2 {
                return Err(DareError::Encoding("truncated kvs snapshot key length".into()));
            }
            let key_len = u16::from_le_bytes(buf[off..off + 2].try_into().unwrap()) as usize;
            off += 2;
            if buf.len() < off + key_len + 4 {
                return Err(DareError::Encoding("truncated kvs snapshot entry".into()));
            }
            let key = buf[off..off + key_len].to_vec();
            off += key_len;
            let value_len = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap()) as usize;
            off += 4;
            if buf.len() < off + value_len {
                return Err(DareError::Encoding("truncated kvs snapshot value".into()));
            }
            let value = buf[off..off + value_len].to_vec();
            off += value_len;
            table.insert(key, value);
        }
        self.table = table;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put_cmd(key: &[u8], value: &[u8]) -> Vec<u8> {
        let mut cmd = vec![OP_PUT];
        cmd.extend_from_slice(&(key.len() as u16).to_le_bytes());
        cmd.extend_from_slice(key);
        cmd.extend_from_slice(&(value.len() as u16).to_le_bytes());
        cmd.extend_from_slice(value);
        cmd
    }

    fn get_cmd(key: &[u8]) -> Vec<u8> {
        let mut cmd = vec![OP_GET];
        cmd.extend_from_slice(&(key.len() as u16).to_le_bytes());
        cmd.extend_from_slice(key);
        cmd
    }

    #[test]
    fn put_then_get_round_trips() {
        let mut sm = KvsSm::new();
        sm.apply_cmd(&put_cmd(b"k", b"v1")).unwrap();
        let reply = sm.apply_cmd(&get_cmd(b"k")).unwrap();
        assert_eq!(reply, vec![1, b'v', b'1']);
    }

    #[test]
    fn get_missing_key_reports_not_found() {
        let mut sm = KvsSm::new();
        let reply = sm.apply_cmd(&get_cmd(b"missing")).unwrap();
        assert_eq!(reply, vec![0]);
    }

    #[test]
    fn delete_removes_key() {
        let mut sm = KvsSm::new();
        sm.apply_cmd(&put_cmd(b"k", b"v")).unwrap();
        let mut del = vec![OP_DELETE];
        del.extend_from_slice(&1u16.to_le_bytes());
        del.extend_from_slice(b"k");
        sm.apply_cmd(&del).unwrap();
        let reply = sm.apply_cmd(&get_cmd(b"k")).unwrap();
        assert_eq!(reply, vec![0]);
    }

    #[test]
    fn snapshot_round_trips_through_a_fresh_instance() {
        let mut sm = KvsSm::new();
        sm.apply_cmd(&put_cmd(b"a", b"1")).unwrap();
        sm.apply_cmd(&put_cmd(b"b", b"22")).unwrap();
        let mut buf = vec![0u8; sm.size() as usize];
        let written = sm.create_snapshot(&mut buf).unwrap();
        assert_eq!(written as usize, buf.len());

        let mut restored = KvsSm::new();
        restored.apply_snapshot(&buf).unwrap();
        assert_eq!(restored.apply_cmd(&get_cmd(b"a")).unwrap(), vec![1, b'1']);
        assert_eq!(
            restored.apply_cmd(&get_cmd(b"b")).unwrap(),
            vec![1, b'2', b'2']
        );
    }
}
