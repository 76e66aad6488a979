//! Runtime configuration shared by the master and the storage nodes.
//!
//! Every field has a default, so a missing config file or a partial one is
//! fine. Durations are kept in milliseconds to keep the JSON file readable.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the master listens on and nodes connect to.
    pub master_addr: SocketAddr,
    /// Parent directory of every node's storage root.
    pub storage_root: PathBuf,

    /// How often a node sends its heartbeat.
    pub heartbeat_interval_ms: u64,
    /// Silence after which the master declares a node dead.
    pub connection_timeout_ms: u64,
    /// How often a node re-verifies its local checksums.
    pub integrity_scan_interval_ms: u64,
    /// Delay before a node retries a lost master connection.
    pub reconnect_delay_ms: u64,

    pub liveness_sweep_interval_ms: u64,
    pub catalog_refresh_interval_ms: u64,
    pub repair_interval_ms: u64,

    /// Deadline of ordinary RPCs (ADD, DELETE, UPDATE, META_QUERY).
    pub rpc_timeout_ms: u64,
    /// Deadline of RPCs carrying a full file (repair ADD, FILE_QUERY).
    pub transfer_timeout_ms: u64,

    /// Target number of holders per file.
    pub replica_factor: usize,
    /// Under-replicated files are left alone until their youngest holder
    /// has been up this long.
    pub startup_grace_ms: u64,
    /// How long a tombstone is kept before the integrity scan purges it.
    pub tombstone_grace_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            master_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            storage_root: PathBuf::from("./.storage"),
            heartbeat_interval_ms: 5_000,
            connection_timeout_ms: 20_000,
            integrity_scan_interval_ms: 25_000,
            reconnect_delay_ms: 2_000,
            liveness_sweep_interval_ms: 2_500,
            catalog_refresh_interval_ms: 10_000,
            repair_interval_ms: 10_000,
            rpc_timeout_ms: 4_000,
            transfer_timeout_ms: 8_000,
            replica_factor: 3,
            startup_grace_ms: 15_000,
            tombstone_grace_ms: 48 * 60 * 60 * 1000,
        }
    }
}

impl Config {
    /// Loads the config from a JSON file, or the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                Ok(serde_json::from_str(&raw)?)
            }
            None => Ok(Self::default()),
        }
    }

    /// Storage directory of a single node.
    pub fn node_storage(&self, node: &str) -> PathBuf {
        self.storage_root.join(node)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn integrity_scan_interval(&self) -> Duration {
        Duration::from_millis(self.integrity_scan_interval_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn liveness_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_sweep_interval_ms)
    }

    pub fn catalog_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.catalog_refresh_interval_ms)
    }

    pub fn repair_interval(&self) -> Duration {
        Duration::from_millis(self.repair_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    pub fn tombstone_grace(&self) -> Duration {
        Duration::from_millis(self.tombstone_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_cluster_constants() {
        let config = Config::default();
        assert_eq!(config.replica_factor, 3);
        assert_eq!(config.rpc_timeout(), Duration::from_secs(4));
        assert_eq!(config.transfer_timeout(), Duration::from_secs(8));
        assert_eq!(config.startup_grace(), Duration::from_secs(15));
        assert_eq!(config.tombstone_grace(), Duration::from_secs(48 * 3600));
    }

    #[test]
    fn partial_file_keeps_remaining_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.json");
        std::fs::write(&path, r#"{"heartbeat_interval_ms": 250, "master_addr": "127.0.0.1:4100"}"#)
            .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.heartbeat_interval(), Duration::from_millis(250));
        assert_eq!(config.master_addr.port(), 4100);
        assert_eq!(config.connection_timeout_ms, 20_000);
    }
}
