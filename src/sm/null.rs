use super::SmAdapter;
use crate::error::DareResult;

/// Discards every command and reports a zero-size snapshot. Used for
/// replication-only benchmarking where the SM itself is not under test
/// (`SM_NULL` in the original).
#[derive(Debug, Default)]
pub struct NullSm;

impl NullSm {
    pub fn new() -> NullSm {
        NullSm
    }
}

impl SmAdapter for NullSm {
    fn apply_cmd(&mut self, _cmd: &[u8]) -> DareResult<Vec<u8>> {
        Ok(Vec::new())
    }

    fn size(&self) -> u32 {
        0
    }

    fn create_snapshot(&self, _buf: &mut [u8]) -> DareResult<u32> {
        Ok(0)
    }

    fn apply_snapshot(&mut self, _buf: &[u8]) -> DareResult<()> {
        Ok(())
    }
}
