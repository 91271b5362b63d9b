//! Configuration system.
//!
//! Loads relay configuration from JSON strings/files (file IO left to app).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::transport::PeerId;

/// Root configuration shared by client/server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Server listen address, e.g. `127.0.0.1:41000`.
    pub server_addr: String,
    /// Fixed simulation tick rate.
    pub tick_hz: u32,
    /// Peer id the transport hands the authoritative peer. Kept in
    /// configuration so authorization checks never hard-code it.
    #[serde(default = "default_server_peer_id")]
    pub server_peer_id: i32,
    /// Seconds between replication snapshots.
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_secs: f32,
    /// Seconds with zero clients connected before the server exits.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: f32,
    /// Display name announced by a client peer.
    #[serde(default = "default_client_name")]
    pub client_name: String,
}

fn default_server_peer_id() -> i32 {
    1
}

fn default_snapshot_interval() -> f32 {
    0.1
}

fn default_idle_timeout() -> f32 {
    60.0
}

fn default_client_name() -> String {
    "Peer".to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:41000".to_string(),
            tick_hz: 60,
            server_peer_id: default_server_peer_id(),
            snapshot_interval_secs: default_snapshot_interval(),
            idle_timeout_secs: default_idle_timeout(),
            client_name: default_client_name(),
        }
    }
}

impl RelayConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    pub fn server_peer(&self) -> PeerId {
        PeerId(self.server_peer_id)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs_f32(self.snapshot_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs_f32(self.idle_timeout_secs)
    }
}
