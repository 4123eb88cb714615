//! Configuration system for dgbus.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $DGBUS_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/dgbus/config.toml
//!   3. ~/.config/dgbus/config.toml

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::wire::{MAX_DATAGRAM_SIZE, MAX_PACKET_SIZE};

/// Smallest packet that can carry a START with an empty topic.
const MIN_PACKET_SIZE: usize = crate::wire::HEADER_LEN + 2;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DgbusConfig {
    pub listener: ListenerConfig,
    pub reassembly: ReassemblyConfig,
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// UDP port to listen on. 0 = OS-assigned.
    pub port: u16,
    /// Address to bind. Unspecified = all interfaces.
    pub bind_addr: IpAddr,
    /// Number of receive tasks sharing the socket. Values below 1 mean 1.
    pub receivers: usize,
    /// Fixed packet size. Larger datagrams are dropped.
    pub packet_size: usize,
    /// SO_RCVBUF in bytes. 0 = packet_size.
    pub recv_buffer_size: usize,
    /// Process packets on the receive task instead of a spawned task.
    pub inline_processing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReassemblyConfig {
    /// How long a DATA packet waits for its START. 0 = wait until shutdown.
    pub start_timeout_ms: u64,
    /// How long a completed message id is remembered, so a stray START
    /// cannot reopen it.
    pub completed_retention_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Run handlers on the blocking pool instead of the processing task.
    pub background: bool,
    /// Handler tasks allowed in flight before callers run handlers themselves.
    pub max_in_flight: usize,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            port: 7420,
            bind_addr: IpAddr::from([0, 0, 0, 0]),
            receivers: 4,
            packet_size: MAX_PACKET_SIZE,
            recv_buffer_size: 0,
            inline_processing: false,
        }
    }
}

impl ListenerConfig {
    pub fn effective_recv_buffer(&self) -> usize {
        if self.recv_buffer_size == 0 {
            self.packet_size
        } else {
            self.recv_buffer_size
        }
    }
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            start_timeout_ms: 0,
            completed_retention_ms: 30_000,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            background: true,
            max_in_flight: 256,
        }
    }
}

impl ReassemblyConfig {
    pub fn start_timeout(&self) -> Option<Duration> {
        (self.start_timeout_ms > 0).then(|| Duration::from_millis(self.start_timeout_ms))
    }

    pub fn completed_retention(&self) -> Duration {
        Duration::from_millis(self.completed_retention_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("dgbus")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("listener.packet_size {0} outside {}..={}", MIN_PACKET_SIZE, MAX_DATAGRAM_SIZE)]
    InvalidPacketSize(usize),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl DgbusConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::from_toml(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            DgbusConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("DGBUS_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&DgbusConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let size = self.listener.packet_size;
        if !(MIN_PACKET_SIZE..=MAX_DATAGRAM_SIZE).contains(&size) {
            return Err(ConfigError::InvalidPacketSize(size));
        }
        Ok(())
    }

    /// Apply DGBUS_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("DGBUS_LISTENER__PORT") {
            if let Ok(p) = v.parse() {
                self.listener.port = p;
            }
        }
        if let Ok(v) = std::env::var("DGBUS_LISTENER__BIND_ADDR") {
            if let Ok(a) = v.parse() {
                self.listener.bind_addr = a;
            }
        }
        if let Ok(v) = std::env::var("DGBUS_LISTENER__RECEIVERS") {
            if let Ok(n) = v.parse() {
                self.listener.receivers = n;
            }
        }
        if let Ok(v) = std::env::var("DGBUS_LISTENER__RECV_BUFFER_SIZE") {
            if let Ok(n) = v.parse() {
                self.listener.recv_buffer_size = n;
            }
        }
        if let Ok(v) = std::env::var("DGBUS_LISTENER__INLINE_PROCESSING") {
            self.listener.inline_processing = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("DGBUS_REASSEMBLY__START_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                self.reassembly.start_timeout_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("DGBUS_DISPATCH__BACKGROUND") {
            self.dispatch.background = v == "true" || v == "1";
        }
    }
}
