//! Configuration management for the relay.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What the relay does with a well-formed message sent by a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboundPolicy {
    /// Reply with an `echo` event to the sender only.
    #[default]
    Echo,
    /// Fan the message out to every other subscriber.
    Rebroadcast,
}

/// Bounds applied when sanitizing published events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntakeLimits {
    pub max_amount: f64,
    pub max_user_length: usize,
    pub max_message_length: usize,
}

impl Default for IntakeLimits {
    fn default() -> Self {
        Self {
            max_amount: 10_000.0,
            max_user_length: 50,
            max_message_length: 200,
        }
    }
}

/// Per-client request budget for the HTTP publish endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Requests allowed per window; 0 disables limiting
    pub max_requests: usize,
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window_secs: 60,
        }
    }
}

/// Main configuration for the relay daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP bind host
    pub host: String,

    /// HTTP bind port
    pub port: u16,

    /// Browser origins allowed by CORS
    pub cors_origins: Vec<String>,

    /// Path to the Unix socket accepting events from local sources
    pub socket_path: PathBuf,

    /// Default log level
    pub log_level: String,

    /// Seconds between dead-connection sweeps
    pub sweep_interval_secs: u64,

    /// Seconds between heartbeat broadcasts
    pub heartbeat_interval_secs: u64,

    /// Milliseconds a publish call waits for slow subscribers
    pub publish_timeout_ms: u64,

    pub inbound_policy: InboundPolicy,

    /// Send a `connection` acknowledgment to new subscribers
    pub send_welcome: bool,

    pub welcome_message: String,

    pub limits: IntakeLimits,

    pub rate_limit: RateLimitConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            cors_origins: vec![
                "http://127.0.0.1:5500".to_string(),
                "http://localhost:5500".to_string(),
            ],
            socket_path: PathBuf::from("/tmp/dotlemor-relay.sock"),
            log_level: "info".to_string(),
            sweep_interval_secs: 30,
            heartbeat_interval_secs: 25,
            publish_timeout_ms: 5_000,
            inbound_policy: InboundPolicy::Echo,
            send_welcome: true,
            welcome_message: "Connected to DotLemor relay".to_string(),
            limits: IntakeLimits::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Default location of the config file.
    pub fn default_path() -> PathBuf {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        dirs::config_dir()
            .unwrap_or_else(|| home.join(".config"))
            .join("dotlemor-relay")
            .join("config.json")
    }

    /// Load `explicit` if given, else the default file if present, else defaults.
    pub fn discover(explicit: Option<&str>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Reject settings the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.sweep_interval_secs == 0 {
            bail!("sweep_interval_secs must be greater than zero");
        }
        if self.heartbeat_interval_secs == 0 {
            bail!("heartbeat_interval_secs must be greater than zero");
        }
        if self.publish_timeout_ms == 0 {
            bail!("publish_timeout_ms must be greater than zero");
        }
        if self.rate_limit.max_requests > 0 && self.rate_limit.window_secs == 0 {
            bail!("rate_limit.window_secs must be greater than zero");
        }
        if self.limits.max_amount.is_nan() || self.limits.max_amount <= 0.0 {
            bail!("limits.max_amount must be positive");
        }
        Ok(())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit.window_secs)
    }

    /// Welcome text for new subscribers, if enabled.
    pub fn welcome(&self) -> Option<String> {
        self.send_welcome.then(|| self.welcome_message.clone())
    }
}
