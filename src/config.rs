//! Static group membership and timing configuration (spec.md §2), loaded
//! once at startup from a JSON file in the same style the teacher loads its
//! own settings: `rustc_serialize::json` decoding into a plain struct.

use crate::error::{DareError, DareResult};
use crate::sm::SmKind;
use rustc_serialize::json;
use std::fs::File;
use std::io::Read;
use std::net::SocketAddr;
use std::path::Path;

/// Default election timeout range and heartbeat interval (§9), used when a
/// config file omits the corresponding field.
pub const DEFAULT_ELECTION_TIMEOUT_MIN_MS: u64 = 150;
pub const DEFAULT_ELECTION_TIMEOUT_MAX_MS: u64 = 300;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 25;
pub const DEFAULT_LOG_SIZE_BYTES: u64 = 16 * 1024 * 1024;
pub const DEFAULT_SNAPSHOT_THRESHOLD_BYTES: u64 = 8 * 1024 * 1024;
/// Every `K`-th replication write per peer is signaled and tracked for a
/// completion (§4.2); the rest land in the peer's region untracked. `K = 1`
/// signals every write, the safest default for small/slow-moving groups.
pub const DEFAULT_WRITE_SIGNAL_INTERVAL: u64 = 1;

#[derive(Debug, Clone, RustcDecodable)]
struct PeerConfigWire {
    id: u8,
    datagram_addr: String,
}

#[derive(Debug, Clone, RustcDecodable)]
struct ConfigWire {
    me: u8,
    peers: Vec<PeerConfigWire>,
    log_size_bytes: Option<u64>,
    snapshot_threshold_bytes: Option<u64>,
    election_timeout_min_ms: Option<u64>,
    election_timeout_max_ms: Option<u64>,
    heartbeat_interval_ms: Option<u64>,
    write_signal_interval: Option<u64>,
    sm: Option<String>,
}

/// One peer's identity and datagram address, as parsed and validated from
/// configuration.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub id: u8,
    pub datagram_addr: SocketAddr,
}

/// The full set of static parameters a server is started with.
#[derive(Debug, Clone)]
pub struct Config {
    pub me: u8,
    pub peers: Vec<PeerConfig>,
    pub log_size_bytes: u64,
    pub snapshot_threshold_bytes: u64,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub write_signal_interval: u64,
    pub sm: SmKind,
}

impl Config {
    /// Parses and validates a config from a JSON string, in the shape:
    ///
    /// ```json
    /// {
    ///   "me": 0,
    ///   "peers": [
    ///     {"id": 0, "datagram_addr": "127.0.0.1:9000"},
    ///     {"id": 1, "datagram_addr": "127.0.0.1:9001"},
    ///     {"id": 2, "datagram_addr": "127.0.0.1:9002"}
    ///   ],
    ///   "log_size_bytes": 16777216,
    ///   "snapshot_threshold_bytes": 8388608,
    ///   "election_timeout_min_ms": 150,
    ///   "election_timeout_max_ms": 300,
    ///   "heartbeat_interval_ms": 25,
    ///   "sm": "kvs"
    /// }
    /// ```
    pub fn from_str(text: &str) -> DareResult<Config> {
        let wire: ConfigWire = json::decode(text)
            .map_err(|e| DareError::Encoding(format!("invalid config json: {}", e)))?;

        if wire.peers.iter().all(|p| p.id != wire.me) {
            return Err(DareError::Encoding(
                "config.me does not name one of config.peers".into(),
            ));
        }
        if wire.peers.len() > 64 {
            return Err(DareError::Encoding(
                "group size exceeds the 64-peer limit".into(),
            ));
        }

        let mut peers = Vec::with_capacity(wire.peers.len());
        for p in wire.peers {
            let addr = p.datagram_addr.parse::<SocketAddr>().map_err(|e| {
                DareError::Encoding(format!("invalid datagram_addr for peer {}: {}", p.id, e))
            })?;
            peers.push(PeerConfig {
                id: p.id,
                datagram_addr: addr,
            });
        }

        let sm = match wire.sm.as_deref() {
            None => SmKind::Null,
            Some(s) => SmKind::from_str(s)
                .ok_or_else(|| DareError::Encoding(format!("unknown sm kind {:?}", s)))?,
        };

        let election_timeout_min_ms = wire
            .election_timeout_min_ms
            .unwrap_or(DEFAULT_ELECTION_TIMEOUT_MIN_MS);
        let election_timeout_max_ms = wire
            .election_timeout_max_ms
            .unwrap_or(DEFAULT_ELECTION_TIMEOUT_MAX_MS);
        if election_timeout_min_ms >= election_timeout_max_ms {
            return Err(DareError::Encoding(
                "election_timeout_min_ms must be < election_timeout_max_ms".into(),
            ));
        }

        Ok(Config {
            me: wire.me,
            peers,
            log_size_bytes: wire.log_size_bytes.unwrap_or(DEFAULT_LOG_SIZE_BYTES),
            snapshot_threshold_bytes: wire
                .snapshot_threshold_bytes
                .unwrap_or(DEFAULT_SNAPSHOT_THRESHOLD_BYTES),
            election_timeout_min_ms,
            election_timeout_max_ms,
            heartbeat_interval_ms: wire
                .heartbeat_interval_ms
                .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_MS),
            write_signal_interval: wire
                .write_signal_interval
                .unwrap_or(DEFAULT_WRITE_SIGNAL_INTERVAL),
            sm,
        })
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> DareResult<Config> {
        let mut file = File::open(path)?;
        let mut text = String::new();
        file.read_to_string(&mut text)?;
        Config::from_str(&text)
    }

    /// Number of peers in the replicated group, including `me`.
    pub fn group_size(&self) -> usize {
        self.peers.len()
    }

    /// A write commits once it has reached this many of the group
    /// (including the leader itself).
    pub fn quorum_size(&self) -> usize {
        self.group_size() / 2 + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "me": 0,
        "peers": [
            {"id": 0, "datagram_addr": "127.0.0.1:9000"},
            {"id": 1, "datagram_addr": "127.0.0.1:9001"},
            {"id": 2, "datagram_addr": "127.0.0.1:9002"}
        ],
        "sm": "kvs"
    }"#;

    #[test]
    fn parses_minimal_config_and_applies_defaults() {
        let cfg = Config::from_str(SAMPLE).unwrap();
        assert_eq!(cfg.me, 0);
        assert_eq!(cfg.group_size(), 3);
        assert_eq!(cfg.quorum_size(), 2);
        assert_eq!(cfg.log_size_bytes, DEFAULT_LOG_SIZE_BYTES);
        assert_eq!(
            cfg.election_timeout_min_ms,
            DEFAULT_ELECTION_TIMEOUT_MIN_MS
        );
        assert_eq!(cfg.sm, SmKind::Kvs);
        assert_eq!(cfg.write_signal_interval, DEFAULT_WRITE_SIGNAL_INTERVAL);
    }

    #[test]
    fn parses_explicit_write_signal_interval() {
        let with_k = SAMPLE.replacen('}', r#", "write_signal_interval": 16}"#, 1);
        let cfg = Config::from_str(&with_k).unwrap();
        assert_eq!(cfg.write_signal_interval, 16);
    }

    #[test]
    fn rejects_me_not_in_peers() {
        let bad = SAMPLE.replace("\"me\": 0", "\"me\": 9");
        assert!(Config::from_str(&bad).is_err());
    }

    #[test]
    fn rejects_inverted_election_timeout_bounds() {
        let bad = SAMPLE.replacen(
            '}',
            r#", "election_timeout_min_ms": 500, "election_timeout_max_ms": 100}"#,
            1,
        );
        assert!(Config::from_str(&bad).is_err());
    }
}
