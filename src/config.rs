//! Configuration for the SetuLink endpoint
//!
//! Loads configuration from a TOML file with the minimal parameters needed
//! for the messaging endpoint. All sections have sensible defaults so the
//! daemon runs without any file present.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Base datagram port; the effective port adds `pid % 1000` so multiple
/// host instances on one machine do not collide.
pub const DEFAULT_BASE_PORT: u16 = 56000;

/// Top-level application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub fallback: FallbackConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Datagram transport configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Enable the messaging endpoint. When false the dispatch loop never
    /// binds a socket and the host runs with messaging absent.
    pub enabled: bool,

    /// Base UDP port. Effective port is `base_port + pid % 1000`.
    pub base_port: u16,

    /// Explicit port override. Takes precedence over the pid-derived port;
    /// `Some(0)` binds an ephemeral port (used by tests).
    pub port: Option<u16>,

    /// Maximum encoded frame size sent as a single datagram. Larger frames
    /// divert through the one-shot TCP fallback channel.
    pub max_datagram: usize,
}

impl NetworkConfig {
    /// Effective datagram port for this process. The pid offset saturates
    /// so an extreme configured base port cannot overflow.
    pub fn effective_port(&self) -> u16 {
        match self.port {
            Some(p) => p,
            None => self
                .base_port
                .saturating_add((std::process::id() % 1000) as u16),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_port: DEFAULT_BASE_PORT,
            port: None,
            max_datagram: 8192,
        }
    }
}

/// Client session liveness configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Seconds of silence before a client is evicted. Small enough to
    /// detect client-process death quickly, large enough to tolerate
    /// normal network jitter.
    pub timeout_secs: f64,

    /// Cap applied to the per-tick delta before aging sessions. Prevents a
    /// long host stall (multi-second compile) from evicting every client.
    pub max_tick_delta_secs: f64,
}

impl SessionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs)
    }

    pub fn max_tick_delta(&self) -> Duration {
        Duration::from_secs_f64(self.max_tick_delta_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 4.0,
            max_tick_delta_secs: 0.1,
        }
    }
}

/// Oversized-payload fallback configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Milliseconds the one-shot listener waits for its single connector
    /// before tearing down (the frame is lost, no retry).
    pub accept_timeout_ms: u64,

    /// Milliseconds allowed for connecting to and reading a streamed body.
    pub fetch_timeout_ms: u64,
}

impl FallbackConfig {
    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            accept_timeout_ms: 5000,
            fetch_timeout_ms: 5000,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            session: SessionConfig::default(),
            fallback: FallbackConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
