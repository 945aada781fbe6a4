/// A 64-bit work-request identifier, bit-packed as `[SSN|WA|TAG|CONN]`
/// (`comparison/DARE/include/dare_ibv_rc.h`): the low 8 bits name the peer
/// connection, the 9th bit flags a request that was explicitly signaled to
/// avoid queue overflow, the 10th bit flags a log "wrap-around" write, and
/// the remaining 54 bits are a send sequence number used to match a
/// completion back to the request that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WrId(u64);

const CONN_MASK: u64 = 0xFF;
const TAG_BIT: u64 = 1 << 8;
const WA_BIT: u64 = 1 << 9;
const SSN_SHIFT: u32 = 10;

impl WrId {
    pub fn new(conn: u8, ssn: u64) -> WrId {
        WrId((ssn << SSN_SHIFT) | conn as u64)
    }

    pub fn from_raw(raw: u64) -> WrId {
        WrId(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn conn(self) -> u8 {
        (self.0 & CONN_MASK) as u8
    }

    pub fn set_conn(&mut self, conn: u8) {
        self.0 = conn as u64 | ((self.0 >> 8) << 8);
    }

    pub fn tag(self) -> bool {
        self.0 & TAG_BIT != 0
    }

    pub fn set_tag(&mut self) {
        self.0 |= TAG_BIT;
    }

    pub fn unset_tag(&mut self) {
        self.0 &= !TAG_BIT;
    }

    pub fn wrap_around(self) -> bool {
        self.0 & WA_BIT != 0
    }

    pub fn set_wrap_around(&mut self) {
        self.0 |= WA_BIT;
    }

    pub fn unset_wrap_around(&mut self) {
        self.0 &= !WA_BIT;
    }

    pub fn ssn(self) -> u64 {
        self.0 >> SSN_SHIFT
    }

    pub fn set_ssn(&mut self, ssn: u64) {
        self.0 = (ssn << SSN_SHIFT) | (self.0 & ((1 << SSN_SHIFT) - 1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_all_fields_independently() {
        let mut id = WrId::new(7, 1234);
        assert_eq!(id.conn(), 7);
        assert_eq!(id.ssn(), 1234);
        assert!(!id.tag());
        assert!(!id.wrap_around());

        id.set_tag();
        id.set_wrap_around();
        assert!(id.tag());
        assert!(id.wrap_around());
        assert_eq!(id.conn(), 7);
        assert_eq!(id.ssn(), 1234);

        id.set_conn(3);
        assert_eq!(id.conn(), 3);
        assert!(id.tag());
        assert!(id.wrap_around());
        assert_eq!(id.ssn(), 1234);

        id.unset_tag();
        assert!(!id.tag());
        assert!(id.wrap_around());

        id.set_ssn(9999);
        assert_eq!(id.ssn(), 9999);
        assert_eq!(id.conn(), 3);
    }
}
