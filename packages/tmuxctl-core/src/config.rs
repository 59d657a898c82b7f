//! Client configuration
//!
//! Loaded from `~/.config/tmuxctl/config.toml` when present, then overridden
//! from `TMUXCTL_*` environment variables.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ControlError, Result};

/// Configuration for [`crate::TmuxControlClient`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    /// tmux binary to spawn (looked up on `PATH` when not absolute)
    pub tmux_binary: String,

    /// Optional tmux server socket name (`tmux -L <name>`)
    pub socket_name: Option<String>,

    /// Deadline for a single command's `%begin`..`%end` block
    pub command_timeout_ms: u64,

    /// How long `connect` waits for the initial control mode acknowledgment
    pub ack_timeout_ms: u64,

    /// Default deadline for `wait_for_output` when the caller gives none
    pub wait_timeout_ms: u64,

    /// How long `disconnect` waits for tmux to exit after `detach-client`
    pub shutdown_grace_ms: u64,

    /// Capacity of the request channel into the connection driver
    pub request_queue_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            tmux_binary: "tmux".to_string(),
            socket_name: None,
            command_timeout_ms: 10_000,
            ack_timeout_ms: 5_000,
            wait_timeout_ms: 30_000,
            shutdown_grace_ms: 1_000,
            request_queue_capacity: 256,
        }
    }
}

/// Default location of the config file.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tmuxctl")
        .join("config.toml")
}

impl ClientConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Load configuration from a TOML file. A missing file yields defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).map_err(|e| ControlError::Config(e.message().to_string()))
    }

    /// Apply `TMUXCTL_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(binary) = lookup("TMUXCTL_TMUX").filter(|v| !v.is_empty()) {
            tracing::info!(binary = %binary, "Overriding tmux binary from environment");
            self.tmux_binary = binary;
        }

        if let Some(socket) = lookup("TMUXCTL_SOCKET").filter(|v| !v.is_empty()) {
            tracing::info!(socket = %socket, "Overriding tmux socket from environment");
            self.socket_name = Some(socket);
        }

        if let Some(raw) = lookup("TMUXCTL_COMMAND_TIMEOUT_MS") {
            match raw.parse() {
                Ok(ms) => self.command_timeout_ms = ms,
                Err(_) => tracing::warn!(value = %raw, "Ignoring invalid TMUXCTL_COMMAND_TIMEOUT_MS"),
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.tmux_binary.trim().is_empty() {
            return Err(ControlError::Config("tmux_binary must not be empty".into()));
        }
        if self.command_timeout_ms == 0 {
            return Err(ControlError::Config("command_timeout_ms must be greater than 0".into()));
        }
        if self.ack_timeout_ms == 0 {
            return Err(ControlError::Config("ack_timeout_ms must be greater than 0".into()));
        }
        if self.request_queue_capacity == 0 {
            return Err(ControlError::Config("request_queue_capacity must be greater than 0".into()));
        }
        Ok(())
    }
}
