use std::{
    fs,
    net::{Ipv4Addr, SocketAddr},
    path::Path,
    time::Duration,
};

use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub time_api: TimeApiConfig,
    pub sync: SyncConfig,
    pub server: ServerConfig,
    pub ui: UiConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeApiConfig {
    pub base_url: String,
    pub time_zone: String,
    pub request_timeout_ms: u64,
}

/// Timer periods and thresholds for the clock service.
///
/// The freshness window, the drift re-sync threshold and the periodic fetch
/// interval are independent knobs.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub fetch_interval_secs: u64,
    pub freshness_window_secs: u64,
    pub drift_resync_secs: u64,
    pub tick_interval_ms: u64,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub allowed_origin: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UiConfig {
    pub console_clock: bool,
    pub time_format: String,
    pub date_format: String,
}

impl Default for TimeApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://timeapi.io".to_string(),
            time_zone: "Europe/Berlin".to_string(),
            request_timeout_ms: 5000,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            fetch_interval_secs: 60,
            freshness_window_secs: 5,
            drift_resync_secs: 900,
            tick_interval_ms: 1000,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 5000)),
            allowed_origin: "http://localhost:3000".to_string(),
        }
    }
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            console_clock: false,
            time_format: "%H:%M:%S".to_string(),
            date_format: "%A, %d/%m/%Y".to_string(),
        }
    }
}

impl AppConfig {
    /// Reads the YAML file at `path`, or returns the defaults when no path is given.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] when the file cannot be read, and the
    /// errors of [`AppConfig::from_yaml`] for its contents.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for invalid YAML or unknown keys and
    /// [`ConfigError::Invalid`] when [`AppConfig::validate`] rejects the result.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a zero interval or timeout, or an
    /// empty time zone.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sync = &self.sync;
        for (name, value) in [
            ("sync.fetch_interval_secs", sync.fetch_interval_secs),
            ("sync.freshness_window_secs", sync.freshness_window_secs),
            ("sync.drift_resync_secs", sync.drift_resync_secs),
            ("sync.tick_interval_ms", sync.tick_interval_ms),
            ("time_api.request_timeout_ms", self.time_api.request_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be greater than 0")));
            }
        }
        if self.time_api.time_zone.trim().is_empty() {
            return Err(ConfigError::Invalid("time_api.time_zone must not be empty".to_string()));
        }
        Ok(())
    }
}

impl TimeApiConfig {
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}/api/time/current/zone", self.base_url.trim_end_matches('/'))
    }
}

impl SyncConfig {
    #[must_use]
    pub const fn fetch_interval(&self) -> Duration {
        Duration::from_secs(self.fetch_interval_secs)
    }

    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    #[must_use]
    pub fn freshness_window_millis(&self) -> i64 {
        secs_to_millis(self.freshness_window_secs)
    }

    #[must_use]
    pub fn drift_resync_millis(&self) -> i64 {
        secs_to_millis(self.drift_resync_secs)
    }
}

fn secs_to_millis(secs: u64) -> i64 {
    i64::try_from(secs.saturating_mul(1000)).unwrap_or(i64::MAX)
}
