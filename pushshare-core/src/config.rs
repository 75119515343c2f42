use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub bus: BusConfig,
    pub membership: MembershipConfig,
    pub relay: RelayConfig,
    pub registration: RegistrationConfig,
    pub facade: FacadeConfig,
    pub logging: LoggingConfig,
}

/// Push server exposing `add/user`, `remove/user`, `update/user` and `event`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub base_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    /// In-process broadcast channel
    Memory,
    /// Redis pub/sub channel on a host-local Redis
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub kind: BusKind,
    pub redis_url: String,
    pub channel: String,
    /// Capacity of the in-process broadcast channel
    pub capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            kind: BusKind::Redis,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            channel: "pushshare:bus".to_string(),
            capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MembershipConfig {
    pub heartbeat_interval_ms: u64,
    pub check_interval_ms: u64,
    pub liveness_timeout_ms: u64,
    /// Delay between `new` and the first election, so acks can arrive
    pub announce_window_ms: u64,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 1000,
            check_interval_ms: 1000,
            liveness_timeout_ms: 3000,
            announce_window_ms: 100,
        }
    }
}

impl MembershipConfig {
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    #[must_use]
    pub const fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    #[must_use]
    pub const fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    #[must_use]
    pub const fn announce_window(&self) -> Duration {
        Duration::from_millis(self.announce_window_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Consecutive frames an unknown instance may appear in before removal
    pub unknown_instance_threshold: u32,
    pub reconnect_min_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            unknown_instance_threshold: 3,
            reconnect_min_delay_ms: 500,
            reconnect_max_delay_ms: 30_000,
        }
    }
}

impl RelayConfig {
    #[must_use]
    pub const fn reconnect_min_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_min_delay_ms)
    }

    #[must_use]
    pub const fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    pub request_timeout_ms: u64,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
        }
    }
}

impl RegistrationConfig {
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FacadeConfig {
    /// Deferral between leader checks while `open()` waits for an election
    pub open_poll_interval_ms: u64,
}

impl Default for FacadeConfig {
    fn default() -> Self {
        Self {
            open_poll_interval_ms: 50,
        }
    }
}

impl FacadeConfig {
    #[must_use]
    pub const fn open_poll_interval(&self) -> Duration {
        Duration::from_millis(self.open_poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // PUSHSHARE_MEMBERSHIP__HEARTBEAT_INTERVAL_MS, PUSHSHARE_SERVER__BASE_URL, ...
        builder = builder.add_source(
            Environment::with_prefix("PUSHSHARE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Check cross-field constraints, returning every violation found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let membership = &self.membership;

        if self.server.base_url.is_empty() {
            errors.push("server.base_url must not be empty".to_string());
        } else if url::Url::parse(&self.server.base_url).is_err() {
            errors.push(format!("server.base_url is not a valid URL: {}", self.server.base_url));
        }
        if membership.heartbeat_interval_ms == 0 {
            errors.push("membership.heartbeat_interval_ms must be greater than 0".to_string());
        }
        if membership.check_interval_ms == 0 {
            errors.push("membership.check_interval_ms must be greater than 0".to_string());
        }
        // Absorb at least one missed heartbeat before declaring a peer dead
        if membership.liveness_timeout_ms <= membership.heartbeat_interval_ms.saturating_mul(2) {
            errors.push(format!(
                "membership.liveness_timeout_ms ({}) must exceed twice the heartbeat interval ({})",
                membership.liveness_timeout_ms, membership.heartbeat_interval_ms
            ));
        }
        if self.relay.reconnect_min_delay_ms > self.relay.reconnect_max_delay_ms {
            errors.push("relay.reconnect_min_delay_ms must not exceed relay.reconnect_max_delay_ms".to_string());
        }
        if self.bus.kind == BusKind::Redis && self.bus.redis_url.is_empty() {
            errors.push("bus.redis_url is required when bus.kind is redis".to_string());
        }
        if self.bus.channel.is_empty() {
            errors.push("bus.channel must not be empty".to_string());
        }
        if self.facade.open_poll_interval_ms == 0 {
            errors.push("facade.open_poll_interval_ms must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
