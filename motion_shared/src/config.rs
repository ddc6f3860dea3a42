//! Configuration system.
//!
//! Loads engine configuration from JSON strings or files.

use std::{path::Path, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Root configuration shared by client/server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Server listen address, e.g. `127.0.0.1:40000`.
    pub server_addr: String,
    /// Room simulation tick rate.
    #[serde(default = "default_tick_hz")]
    pub tick_hz: u32,
    /// Per-room player capacity (server only).
    #[serde(default = "default_max_players")]
    pub max_players: u32,
    /// Player name (client only).
    #[serde(default = "default_player_name")]
    pub player_name: String,
    /// Room to join; `None` picks any room with a free slot (client only).
    #[serde(default)]
    pub room_id: Option<String>,
    /// First reconnect delay (client only).
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    /// Reconnect delay ceiling (client only).
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
}

fn default_tick_hz() -> u32 {
    60
}

fn default_max_players() -> u32 {
    2
}

fn default_player_name() -> String {
    "Player".to_string()
}

fn default_reconnect_initial_ms() -> u64 {
    300
}

fn default_reconnect_max_ms() -> u64 {
    5000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:40000".to_string(),
            tick_hz: default_tick_hz(),
            max_players: default_max_players(),
            player_name: default_player_name(),
            room_id: None,
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
        }
    }
}

impl EngineConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Reads and parses a JSON config file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let cfg = Self::from_json_str(&raw)
            .with_context(|| format!("parse config {}", path.display()))?;
        tracing::info!(path = %path.display(), "Loaded config");
        Ok(cfg)
    }

    /// Interval between room ticks.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.tick_hz.max(1)))
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }
}
