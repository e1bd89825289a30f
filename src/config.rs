use crate::application::PresenceConfig;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("presence timeout ({timeout}s) must exceed the heartbeat interval ({heartbeat}s)")]
    TimeoutNotAboveHeartbeat { timeout: u64, heartbeat: u64 },
    #[error("presence timeout tolerates {tolerated} missed heartbeats, at least {required} required")]
    TooFewMissedHeartbeats { tolerated: u32, required: u32 },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Heartbeats a backend must be allowed to miss before it is evicted.
pub const MIN_MISSED_HEARTBEATS: u32 = 1;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub db_path: String,
    pub debug: bool,

    // Presence
    pub heartbeat_interval_secs: u64,
    pub presence_timeout_secs: u64,
    pub presence_sweep_secs: u64,

    // Pending request expiry, 0 disables
    pub request_ttl_secs: u64,
    pub request_sweep_secs: u64,

    /// Outbound frames buffered per connection
    pub outbound_queue: usize,
    pub shutdown_grace_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:5000".to_string(),
            db_path: "stores.db".to_string(),
            debug: false,
            heartbeat_interval_secs: 30,
            presence_timeout_secs: 90,
            presence_sweep_secs: 10,
            request_ttl_secs: 300,
            request_sweep_secs: 30,
            outbound_queue: 256,
            shutdown_grace_secs: 10,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("heartbeat interval", self.heartbeat_interval_secs),
            ("presence timeout", self.presence_timeout_secs),
            ("presence sweep interval", self.presence_sweep_secs),
            ("request sweep interval", self.request_sweep_secs),
            ("outbound queue", self.outbound_queue as u64),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.presence_timeout_secs <= self.heartbeat_interval_secs {
            return Err(ConfigError::TimeoutNotAboveHeartbeat {
                timeout: self.presence_timeout_secs,
                heartbeat: self.heartbeat_interval_secs,
            });
        }
        let tolerated = self.presence().tolerated_missed_heartbeats();
        if tolerated < MIN_MISSED_HEARTBEATS {
            return Err(ConfigError::TooFewMissedHeartbeats {
                tolerated,
                required: MIN_MISSED_HEARTBEATS,
            });
        }
        Ok(())
    }

    pub fn presence(&self) -> PresenceConfig {
        PresenceConfig {
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            timeout: Duration::from_secs(self.presence_timeout_secs),
            sweep_interval: Duration::from_secs(self.presence_sweep_secs),
        }
    }

    /// None when pending requests never expire.
    pub fn request_ttl(&self) -> Option<Duration> {
        (self.request_ttl_secs > 0).then(|| Duration::from_secs(self.request_ttl_secs))
    }

    pub fn request_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.request_sweep_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

pub fn load_config() -> anyhow::Result<Config> {
    load_config_from(|key| std::env::var(key).ok())
}

/// Build a config from any variable source. Unparseable numbers keep their defaults.
pub fn load_config_from(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Config> {
    let defaults = Config::default();
    let number = |key: &str, default: u64| -> u64 {
        var(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
    };

    let listen_addr = var("STORE_RELAY_LISTEN_ADDR").unwrap_or(defaults.listen_addr);

    let db_path = var("STORE_RELAY_DB_PATH").unwrap_or(defaults.db_path);

    let debug = var("DEBUG").is_some();

    let heartbeat_interval_secs = number(
        "STORE_RELAY_HEARTBEAT_INTERVAL_SECS",
        defaults.heartbeat_interval_secs,
    );
    let presence_timeout_secs = number(
        "STORE_RELAY_PRESENCE_TIMEOUT_SECS",
        defaults.presence_timeout_secs,
    );
    let presence_sweep_secs = number("STORE_RELAY_PRESENCE_SWEEP_SECS", defaults.presence_sweep_secs);

    let request_ttl_secs = number("STORE_RELAY_REQUEST_TTL_SECS", defaults.request_ttl_secs);
    let request_sweep_secs = number("STORE_RELAY_REQUEST_SWEEP_SECS", defaults.request_sweep_secs);

    let outbound_queue = number("STORE_RELAY_OUTBOUND_QUEUE", defaults.outbound_queue as u64) as usize;
    let shutdown_grace_secs = number("STORE_RELAY_SHUTDOWN_GRACE_SECS", defaults.shutdown_grace_secs);

    Ok(Config {
        listen_addr,
        db_path,
        debug,
        heartbeat_interval_secs,
        presence_timeout_secs,
        presence_sweep_secs,
        request_ttl_secs,
        request_sweep_secs,
        outbound_queue,
        shutdown_grace_secs,
    })
}
