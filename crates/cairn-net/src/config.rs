use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{NetError, NetResult};

/// Node configuration, loadable from TOML. Missing keys take defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub listen_addr: SocketAddr,
    /// Hex node identifier. Derived from the listen address when unset.
    pub node_id: Option<String>,
    /// Storage root. Nodes without one act as clients only.
    pub root: Option<PathBuf>,
    /// Reactor threads.
    pub net_threads: usize,
    /// Ordered (blocking) worker threads.
    pub io_threads: usize,
    /// Unordered worker threads, fed by `NOLOCK` frames.
    pub nonblocking_io_threads: usize,
    /// Capacity of each worker queue.
    pub queue_capacity: usize,
    pub transaction_timeout_ms: u64,
    pub sweep_interval_ms: u64,
    /// Consecutive sweeps with expirations before a connection is reset.
    pub max_stall: u32,
    /// Largest payload carried by one read or list reply chunk.
    pub max_read_chunk: u64,
    pub max_frame_size: u64,
    pub connect_timeout_ms: u64,
    /// Peers added at startup.
    pub peers: Vec<SocketAddr>,
    /// fsync journal records before acknowledging writes.
    pub journal_sync: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 1025)),
            node_id: None,
            root: None,
            net_threads: 2,
            io_threads: 2,
            nonblocking_io_threads: 2,
            queue_capacity: 1024,
            transaction_timeout_ms: 5000,
            sweep_interval_ms: 1000,
            max_stall: 5,
            max_read_chunk: 1024 * 1024,
            max_frame_size: cairn_protocol::MAX_FRAME_SIZE,
            connect_timeout_ms: 3000,
            peers: Vec::new(),
            journal_sync: false,
        }
    }
}

impl NodeConfig {
    /// Load and validate a TOML config file.
    pub fn load(path: &Path) -> NetResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> NetResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| NetError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> NetResult<()> {
        let positive = [
            ("net_threads", self.net_threads as u64),
            ("io_threads", self.io_threads as u64),
            ("nonblocking_io_threads", self.nonblocking_io_threads as u64),
            ("queue_capacity", self.queue_capacity as u64),
            ("transaction_timeout_ms", self.transaction_timeout_ms),
            ("sweep_interval_ms", self.sweep_interval_ms),
            ("max_stall", u64::from(self.max_stall)),
            ("max_read_chunk", self.max_read_chunk),
            ("connect_timeout_ms", self.connect_timeout_ms),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(NetError::Config(format!("{name} must be greater than zero")));
        }
        if self.max_read_chunk > self.max_frame_size {
            return Err(NetError::Config(format!(
                "max_read_chunk ({}) exceeds max_frame_size ({})",
                self.max_read_chunk, self.max_frame_size
            )));
        }
        if let Some(hex) = &self.node_id {
            cairn_types::ObjectId::from_hex(hex)
                .map_err(|e| NetError::Config(format!("node_id: {e}")))?;
        }
        Ok(())
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
