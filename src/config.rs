//! Transport configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WireError};
use crate::protocol::{CHUNK_SIZE, MAX_FRAME_SIZE, PACKET_SIZE};

/// Tunables shared by both ends of a connection. Every field has a default,
/// so a partial TOML file only needs to name what it changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Frame writes are split into packets of this size.
    pub packet_size: usize,
    /// Chunk size for streamed transfers.
    pub chunk_size: usize,
    /// Hard cap on any single frame, applied even when a caller passes no
    /// limit of its own.
    pub max_frame_size: usize,
    /// Seconds a receive may block before failing; 0 blocks forever.
    pub read_timeout_secs: u64,
    /// Idle seconds before a keep-alive ping becomes due; 0 disables
    /// keep-alive on this end.
    pub keepalive_secs: u64,
    /// Bulk transfer: chunks buffered between the archiver and network
    /// threads.
    pub channel_buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            packet_size: PACKET_SIZE,
            chunk_size: CHUNK_SIZE,
            max_frame_size: MAX_FRAME_SIZE,
            read_timeout_secs: 30,
            keepalive_secs: 0,
            channel_buffer: 64,
        }
    }
}

impl TransportConfig {
    pub fn read_timeout(&self) -> Option<Duration> {
        if self.read_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.read_timeout_secs))
        }
    }

    pub fn keepalive_lapse(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text)
            .map_err(|e| WireError::Config(format!("{}: {e}", path.display())))
    }
}
