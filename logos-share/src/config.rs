//! Session configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ShareError;

/// Settings for one sharing session.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShareConfig {
    /// Relay WebSocket URL
    pub server_url: String,
    /// Workspace root shared by this side
    pub workspace_root: PathBuf,
    /// Glob patterns left out of file-structure snapshots
    pub exclude: Vec<String>,
    /// How long `create_room`/`join_room` wait for the relay's answer
    pub ack_timeout_ms: u64,
    /// Buffer size of transport and editor event channels
    pub channel_capacity: usize,
}

impl Default for ShareConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9191".to_string(),
            workspace_root: PathBuf::from("."),
            exclude: vec![
                "**/.git/**".to_string(),
                "**/node_modules/**".to_string(),
                "**/target/**".to_string(),
            ],
            ack_timeout_ms: 5_000,
            channel_capacity: 256,
        }
    }
}

impl ShareConfig {
    /// Default settings for a workspace at `root`.
    pub fn for_workspace(root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: root.into(),
            ..Self::default()
        }
    }

    /// Parse from JSON; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ShareError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ShareError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ShareError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ShareError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&text)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    fn validate(&self) -> Result<(), ShareError> {
        if self.channel_capacity == 0 {
            return Err(ShareError::Config("channel_capacity must be > 0".into()));
        }
        if !(self.server_url.starts_with("ws://") || self.server_url.starts_with("wss://")) {
            return Err(ShareError::Config(format!(
                "server_url must be a ws:// or wss:// URL, got {:?}",
                self.server_url
            )));
        }
        for pattern in &self.exclude {
            glob::Pattern::new(pattern)
                .map_err(|e| ShareError::Config(format!("exclude {pattern:?}: {}", e.msg)))?;
        }
        Ok(())
    }
}
