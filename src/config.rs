//! Configuration module for Arbor.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ArborError, Result};
use crate::types::NodeId;

/// Main configuration for an Arbor node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArborConfig {
    /// Consensus configuration.
    pub raft: RaftConfig,
    /// Observability configuration.
    pub observability: ObservabilityConfig,
}

impl ArborConfig {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ArborError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| ArborError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        self.raft.validate()
    }

    /// Create a minimal development configuration.
    pub fn development() -> Self {
        Self {
            raft: RaftConfig {
                server_id: 1,
                cluster_size: 1,
                durability_dir: PathBuf::from("/tmp/arbor/durability"),
                ..RaftConfig::default()
            },
            observability: ObservabilityConfig::default(),
        }
    }
}

/// Consensus configuration for a single server.
///
/// Servers are numbered `1..=cluster_size`; `server_id` identifies this one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    /// This server's id.
    pub server_id: NodeId,
    /// Total number of servers in the cluster.
    pub cluster_size: u16,
    /// Minimum election timeout.
    #[serde(with = "humantime_serde")]
    pub election_timeout_min: Duration,
    /// Maximum election timeout.
    #[serde(with = "humantime_serde")]
    pub election_timeout_max: Duration,
    /// Leader heartbeat period.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Peer retry backoff after an RPC failure.
    #[serde(with = "humantime_serde")]
    pub rpc_backoff: Duration,
    /// Per-RPC deadline, enforced by the transport.
    #[serde(with = "humantime_serde")]
    pub rpc_timeout: Duration,
    /// Directory for persisted term, vote and log.
    pub durability_dir: PathBuf,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            server_id: 1,
            cluster_size: 3,
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            rpc_backoff: Duration::from_millis(100),
            rpc_timeout: Duration::from_millis(100),
            durability_dir: PathBuf::from("/var/lib/arbor/durability"),
        }
    }
}

impl RaftConfig {
    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.cluster_size == 0 {
            return Err(ArborError::InvalidConfig {
                field: "raft.cluster_size".to_string(),
                reason: "Cluster size must be non-zero".to_string(),
            });
        }

        if self.server_id == 0 || self.server_id > self.cluster_size {
            return Err(ArborError::InvalidConfig {
                field: "raft.server_id".to_string(),
                reason: format!("Server id must be in 1..={}", self.cluster_size),
            });
        }

        if self.election_timeout_min >= self.election_timeout_max {
            return Err(ArborError::InvalidConfig {
                field: "raft.election_timeout_min".to_string(),
                reason: "Minimum election timeout must be below the maximum".to_string(),
            });
        }

        if self.heartbeat_interval.is_zero() {
            return Err(ArborError::InvalidConfig {
                field: "raft.heartbeat_interval".to_string(),
                reason: "Heartbeat interval must be non-zero".to_string(),
            });
        }

        Ok(())
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level.
    pub log_level: String,
    /// Enable JSON logging.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Serde helper for Duration using humantime format.
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        } else if let Some(s_val) = s.strip_suffix('s') {
            s_val
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| e.to_string())
        } else if let Some(m) = s.strip_suffix('m') {
            m.parse::<u64>()
                .map(|v| Duration::from_secs(v * 60))
                .map_err(|e| e.to_string())
        } else {
            s.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        }
    }
}
