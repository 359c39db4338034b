//! Configuration for the relay engine.
//!
//! Configuration is passed to [`RelayEngine::new()`](crate::RelayEngine::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use relay_engine::config::{RelayConfig, PeerConfig};
//!
//! let config = RelayConfig {
//!     local_server_id: 1,
//!     peers: vec![PeerConfig::for_testing(2, "10.0.0.2", 6380)],
//!     ..Default::default()
//! };
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! RelayConfig
//! ├── local_server_id: i32      # This node's identity in the mesh
//! ├── local_ip / local_port     # Address advertised during the handshake
//! ├── settings: RelaySettings   # Timeouts, backoffs, retry ceiling
//! ├── peers: Vec<PeerConfig>    # Remote nodes to forward to
//! └── conflict_cache_capacity   # LRU bound for the freshness cache
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config: passed to RelayEngine::new()
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `RelayEngine::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// The identity of the local node. Records originated here are never
    /// read back from peers' logs, and peers never get their own writes
    /// echoed back.
    pub local_server_id: i32,

    /// Address advertised to peers during the handshake so the remote end
    /// can open its own reverse session.
    #[serde(default = "default_local_ip")]
    pub local_ip: String,

    /// Control port advertised alongside `local_ip`.
    #[serde(default = "default_local_port")]
    pub local_port: u16,

    /// Timeouts, backoffs and retry ceilings.
    #[serde(default)]
    pub settings: RelaySettings,

    /// The list of peers to forward the change log to.
    pub peers: Vec<PeerConfig>,

    /// Capacity bound for the last-writer-wins conflict cache.
    #[serde(default = "default_cache_capacity")]
    pub conflict_cache_capacity: usize,
}

fn default_local_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_local_port() -> u16 {
    6379
}

fn default_cache_capacity() -> usize {
    crate::cache::DEFAULT_CONFLICT_CACHE_CAPACITY
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            local_server_id: 0,
            local_ip: default_local_ip(),
            local_port: default_local_port(),
            settings: RelaySettings::default(),
            peers: Vec::new(),
            conflict_cache_capacity: default_cache_capacity(),
        }
    }
}

impl RelayConfig {
    /// Create a minimal config for testing (fast timeouts, small cache).
    pub fn for_testing(local_server_id: i32) -> Self {
        Self {
            local_server_id,
            local_ip: "127.0.0.1".to_string(),
            local_port: 0,
            settings: RelaySettings::testing(),
            peers: Vec::new(),
            conflict_cache_capacity: 1024,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PeerConfig: one entry per remote node
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for a single peer node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Peer's identity in the mesh (loop-prevention id).
    pub server_id: i32,

    /// Control endpoint address. The streaming data channel connects to
    /// `port + settings.data_port_offset`.
    pub ip: String,
    pub port: u16,
}

impl PeerConfig {
    /// Create a peer config for testing.
    pub fn for_testing(server_id: i32, ip: &str, port: u16) -> Self {
        Self {
            server_id,
            ip: ip.to_string(),
            port,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RelaySettings: timeouts, backoffs, retry ceiling
// ═══════════════════════════════════════════════════════════════════════════════

/// Tunable timing parameters for the sending loops and the supervisor.
///
/// Defaults match the production cluster convention: bounded socket
/// operations, a fixed 2 s reconnect backoff, and a bounded read-retry
/// ceiling before a sender is disabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySettings {
    /// Bounded connect timeout (ms) for both channels.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Bounded send timeout (ms) once connected.
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    /// Bounded receive timeout (ms) once connected.
    #[serde(default = "default_recv_timeout_ms")]
    pub recv_timeout_ms: u64,

    /// Wait after a failed data-channel connect, as a duration string
    /// (e.g. "2s"). Connect failures never count toward the fatal ceiling.
    #[serde(default = "default_connect_backoff")]
    pub connect_backoff: String,

    /// Wait (ms) after a failed transmission before resetting the reader.
    #[serde(default = "default_send_retry_delay_ms")]
    pub send_retry_delay_ms: u64,

    /// Wait (ms) after a non-graceful read failure before retrying.
    #[serde(default = "default_read_retry_delay_ms")]
    pub read_retry_delay_ms: u64,

    /// Consecutive non-graceful read failures tolerated before the sender
    /// goes fatal and is disabled pending renegotiation.
    #[serde(default = "default_max_read_retries")]
    pub max_read_retries: u32,

    /// Supervisor cycle period, as a duration string (e.g. "2s").
    #[serde(default = "default_sync_interval")]
    pub sync_interval: String,

    /// Streaming connections use the peer's control port plus this offset.
    #[serde(default = "default_data_port_offset")]
    pub data_port_offset: u16,
}

fn default_connect_timeout_ms() -> u64 {
    1500
}

fn default_send_timeout_ms() -> u64 {
    3000
}

fn default_recv_timeout_ms() -> u64 {
    3000
}

fn default_connect_backoff() -> String {
    "2s".to_string()
}

fn default_send_retry_delay_ms() -> u64 {
    1000
}

fn default_read_retry_delay_ms() -> u64 {
    500
}

fn default_max_read_retries() -> u32 {
    10
}

fn default_sync_interval() -> String {
    "2s".to_string()
}

fn default_data_port_offset() -> u16 {
    1000
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 1500,
            send_timeout_ms: 3000,
            recv_timeout_ms: 3000,
            connect_backoff: "2s".to_string(),
            send_retry_delay_ms: 1000,
            read_retry_delay_ms: 500,
            max_read_retries: 10,
            sync_interval: "2s".to_string(),
            data_port_offset: 1000,
        }
    }
}

impl RelaySettings {
    /// Fast timings for tests.
    pub fn testing() -> Self {
        Self {
            connect_timeout_ms: 500,
            send_timeout_ms: 500,
            recv_timeout_ms: 500,
            connect_backoff: "20ms".to_string(),
            send_retry_delay_ms: 10,
            read_retry_delay_ms: 5,
            max_read_retries: 3,
            sync_interval: "50ms".to_string(),
            data_port_offset: 1,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }

    /// Parse the connect backoff string to a Duration.
    pub fn connect_backoff_duration(&self) -> Duration {
        humantime::parse_duration(&self.connect_backoff).unwrap_or(Duration::from_secs(2))
    }

    pub fn send_retry_delay(&self) -> Duration {
        Duration::from_millis(self.send_retry_delay_ms)
    }

    pub fn read_retry_delay(&self) -> Duration {
        Duration::from_millis(self.read_retry_delay_ms)
    }

    /// Parse the supervisor period string to a Duration.
    pub fn sync_interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.sync_interval).unwrap_or(Duration::from_secs(2))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
