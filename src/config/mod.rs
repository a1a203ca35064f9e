//! Configuration for the mesh core.
//!
//! Centralized, validated configuration with TOML file loading and
//! environment-variable overrides (`BITCHAT_*`).

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Default initial TTL stamped on locally originated packets
pub const DEFAULT_INITIAL_TTL: u8 = 7;

/// Bounds on the seen-set capacity
pub const MIN_SEEN_CAPACITY: usize = 10;
pub const MAX_SEEN_CAPACITY: usize = 1000;

/// Top-level protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Effective transport MTU; serialized packets above this are fragmented
    pub mtu: usize,
    /// Initial TTL for locally originated packets
    pub initial_ttl: u8,
    /// Whether this node relays packets for others
    pub relay_enabled: bool,
    /// Seen-set capacity (clamped to 10..=1000 by `validate`)
    pub seen_capacity: usize,
    /// Recent-packet cache capacity backing sync replay
    pub packet_cache_size: usize,
    /// Inactivity window after which partial fragment assemblies are dropped
    #[serde(with = "humantime_serde")]
    pub fragment_timeout: Duration,
    /// Hard cap on concurrent Noise sessions
    pub max_sessions: usize,
    /// Pending handshakes older than this are destroyed
    #[serde(with = "humantime_serde")]
    pub pending_handshake_timeout: Duration,
    /// Session manager cleanup tick
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
    /// Sync engine configuration
    pub sync: SyncConfig,
}

/// Sync engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Interval between outgoing REQUEST_SYNC rounds
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Byte budget for outgoing GCS filter data
    pub max_filter_bytes: usize,
    /// Target false-positive rate for the GCS filter
    pub target_fpr: f64,
    /// Incoming filters larger than this are rejected
    pub max_accept_filter_bytes: usize,
    /// Per-round cap on retransmitted packets
    pub max_packets_per_round: usize,
    /// Per-round cap on retransmitted bytes
    pub max_bytes_per_round: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            mtu: 512,
            initial_ttl: DEFAULT_INITIAL_TTL,
            relay_enabled: true,
            seen_capacity: 500,
            packet_cache_size: 512,
            fragment_timeout: Duration::from_secs(30),
            max_sessions: 50,
            pending_handshake_timeout: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(30),
            sync: SyncConfig::default(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            max_filter_bytes: 512,
            target_fpr: 0.01,
            max_accept_filter_bytes: 1024,
            max_packets_per_round: 64,
            max_bytes_per_round: 32 * 1024,
        }
    }
}

impl ProtocolConfig {
    /// Load configuration from a TOML file, then apply environment overrides
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        let mut config: Self = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
        config.override_from_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply `BITCHAT_*` environment overrides
    pub fn override_from_env(&mut self) {
        if let Ok(mtu) = env::var("BITCHAT_MTU") {
            if let Ok(mtu) = mtu.parse() {
                self.mtu = mtu;
            }
        }
        if let Ok(ttl) = env::var("BITCHAT_INITIAL_TTL") {
            if let Ok(ttl) = ttl.parse() {
                self.initial_ttl = ttl;
            }
        }
        if let Ok(relay) = env::var("BITCHAT_RELAY_ENABLED") {
            self.relay_enabled = matches!(relay.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Ok(cap) = env::var("BITCHAT_SEEN_CAPACITY") {
            if let Ok(cap) = cap.parse() {
                self.seen_capacity = cap;
            }
        }
    }

    /// Validate and clamp configuration values
    pub fn validate(&mut self) -> Result<()> {
        if self.mtu < 64 {
            return Err(Error::Config(format!(
                "mtu {} too small for the fixed header plus a fragment",
                self.mtu
            )));
        }
        if self.initial_ttl == 0 {
            return Err(Error::Config("initial_ttl must be at least 1".into()));
        }
        self.seen_capacity = self
            .seen_capacity
            .clamp(MIN_SEEN_CAPACITY, MAX_SEEN_CAPACITY);
        if self.packet_cache_size == 0 {
            return Err(Error::Config("packet_cache_size must be nonzero".into()));
        }
        if self.max_sessions == 0 {
            return Err(Error::Config("max_sessions must be nonzero".into()));
        }
        if !(self.sync.target_fpr > 0.0 && self.sync.target_fpr < 1.0) {
            return Err(Error::Config(format!(
                "sync.target_fpr {} must be in (0, 1)",
                self.sync.target_fpr
            )));
        }
        if self.sync.max_filter_bytes == 0 {
            return Err(Error::Config("sync.max_filter_bytes must be nonzero".into()));
        }
        Ok(())
    }

    /// Largest serialized packet size that is sent without fragmentation
    pub fn fragment_threshold(&self) -> usize {
        self.mtu
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_is_valid() {
        let mut config = ProtocolConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.seen_capacity, 500);
        assert_eq!(config.initial_ttl, 7);
    }

    #[test]
    fn test_seen_capacity_clamped() {
        let mut config = ProtocolConfig {
            seen_capacity: 5,
            ..Default::default()
        };
        config.validate().unwrap();
        assert_eq!(config.seen_capacity, MIN_SEEN_CAPACITY);

        config.seen_capacity = 100_000;
        config.validate().unwrap();
        assert_eq!(config.seen_capacity, MAX_SEEN_CAPACITY);
    }

    #[test]
    fn test_rejects_bad_fpr() {
        let mut config = ProtocolConfig::default();
        config.sync.target_fpr = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
mtu = 244
initial_ttl = 5
relay_enabled = false
seen_capacity = 200
packet_cache_size = 128
fragment_timeout = "30s"
max_sessions = 20
pending_handshake_timeout = "30s"
cleanup_interval = "15s"

[sync]
interval = "5s"
max_filter_bytes = 256
target_fpr = 0.02
max_accept_filter_bytes = 1024
max_packets_per_round = 32
max_bytes_per_round = 16384
"#
        )
        .unwrap();

        let config = ProtocolConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.mtu, 244);
        assert!(!config.relay_enabled);
        assert_eq!(config.sync.interval, Duration::from_secs(5));
    }
}
