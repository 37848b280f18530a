//! Application configuration management.
//!
//! Settings come from a JSON file (by default
//! `~/.config/glucowallet/config.json`) overlaid with `GLUCOWALLET_*`
//! environment variables. The merged result is validated once into an
//! immutable `Settings` value.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::api::client::DEFAULT_REQUEST_TIMEOUT_SECS;
use crate::auth::Credentials;
use crate::poller::{
    PollSettings, DEFAULT_BACKOFF_INITIAL_SECS, DEFAULT_BACKOFF_MAX_SECS, DEFAULT_POLL_INTERVAL_SECS,
};
use crate::publish::influx::{DEFAULT_MAX_RETRIES, DEFAULT_RETRY_BACKOFF_MS};

/// Upper bound accepted for `influxdb.max_retries`.
const MAX_SINK_RETRIES: u32 = 10;
use crate::publish::{InfluxTarget, DEFAULT_MEASUREMENT};

/// Application name used for the config directory
const APP_NAME: &str = "glucowallet";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Prefix shared by every environment override
const ENV_PREFIX: &str = "GLUCOWALLET_";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Missing required settings: {}", .0.join(", "))]
    Missing(Vec<String>),

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkUpSection {
    pub username: Option<String>,
    pub password: Option<String>,
    pub region: Option<String>,
    pub patient_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InfluxSection {
    pub url: Option<String>,
    pub bucket: Option<String>,
    pub org: Option<String>,
    pub token: Option<String>,
    pub measurement: Option<String>,
    pub max_retries: Option<u32>,
    pub retry_backoff_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PollSection {
    pub interval_secs: Option<u64>,
    pub backoff_initial_secs: Option<u64>,
    pub backoff_max_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
}

/// Raw, possibly incomplete configuration as read from file and env.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub linkup: LinkUpSection,
    #[serde(default, alias = "influx")]
    pub influxdb: InfluxSection,
    #[serde(default)]
    pub poll: PollSection,
}

/// Validated settings handed to the core at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub credentials: Credentials,
    pub region: Option<String>,
    pub patient_id: Option<String>,
    pub influx: InfluxTarget,
    pub measurement: String,
    pub sink_max_retries: u32,
    pub sink_retry_backoff: Duration,
    pub poll: PollSettings,
    pub request_timeout: Duration,
}

impl Config {
    /// Read a config file. An explicit path must exist; the default path is
    /// optional and an absent file yields an empty config.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match Self::config_path() {
                Some(p) => (p, false),
                None => return Ok(Self::default()),
            },
        };

        if !required && !path.exists() {
            info!(path = %path.display(), "No config file found, using environment variables");
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let config = serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        debug!(path = %path.display(), "Config file loaded");
        Ok(config)
    }

    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Overlay `GLUCOWALLET_*` variables from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Overlay values from `lookup`, keyed by full variable name. Set values
    /// win over whatever the file said.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |suffix: &str| {
            lookup(&format!("{}{}", ENV_PREFIX, suffix)).filter(|v| !v.trim().is_empty())
        };

        override_with(&mut self.linkup.username, var("LINKUP_USERNAME"));
        override_with(&mut self.linkup.password, var("LINKUP_PASSWORD"));
        override_with(&mut self.linkup.region, var("LINKUP_REGION"));
        override_with(&mut self.linkup.patient_id, var("LINKUP_PATIENT_ID"));
        override_with(&mut self.influxdb.url, var("INFLUXDB_URL"));
        override_with(&mut self.influxdb.bucket, var("INFLUXDB_BUCKET"));
        override_with(&mut self.influxdb.org, var("INFLUXDB_ORG"));
        override_with(&mut self.influxdb.token, var("INFLUXDB_TOKEN"));
        override_with(&mut self.influxdb.measurement, var("INFLUXDB_MEASUREMENT"));

        if let Some(raw) = var("POLL_INTERVAL_SECS") {
            let secs = raw.trim().parse::<u64>().map_err(|e| ConfigError::Invalid {
                key: format!("{}POLL_INTERVAL_SECS", ENV_PREFIX),
                reason: e.to_string(),
            })?;
            self.poll.interval_secs = Some(secs);
        }
        Ok(())
    }

    /// Check required keys (all missing ones reported at once) and fill in
    /// defaults for the rest.
    pub fn into_settings(self) -> Result<Settings, ConfigError> {
        let mut missing = Vec::new();
        let mut require = |value: Option<String>, key: &str| -> String {
            match value.filter(|v| !v.trim().is_empty()) {
                Some(v) => v,
                None => {
                    missing.push(key.to_string());
                    String::new()
                }
            }
        };

        let username = require(self.linkup.username, "linkup.username");
        let password = require(self.linkup.password, "linkup.password");
        let url = require(self.influxdb.url, "influxdb.url");
        let bucket = require(self.influxdb.bucket, "influxdb.bucket");
        let org = require(self.influxdb.org, "influxdb.org");
        let token = require(self.influxdb.token, "influxdb.token");

        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        let interval = positive_secs(
            "poll.interval_secs",
            self.poll.interval_secs.unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
        )?;
        let backoff_initial = positive_secs(
            "poll.backoff_initial_secs",
            self.poll.backoff_initial_secs.unwrap_or(DEFAULT_BACKOFF_INITIAL_SECS),
        )?;
        let backoff_max = positive_secs(
            "poll.backoff_max_secs",
            self.poll.backoff_max_secs.unwrap_or(DEFAULT_BACKOFF_MAX_SECS),
        )?;
        if backoff_max < backoff_initial {
            return Err(ConfigError::Invalid {
                key: "poll.backoff_max_secs".to_string(),
                reason: "must not be lower than poll.backoff_initial_secs".to_string(),
            });
        }
        let sink_max_retries = self.influxdb.max_retries.unwrap_or(DEFAULT_MAX_RETRIES);
        if sink_max_retries > MAX_SINK_RETRIES {
            return Err(ConfigError::Invalid {
                key: "influxdb.max_retries".to_string(),
                reason: format!("must be at most {}", MAX_SINK_RETRIES),
            });
        }
        let request_timeout = positive_secs(
            "poll.request_timeout_secs",
            self.poll.request_timeout_secs.unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
        )?;

        Ok(Settings {
            credentials: Credentials::new(username, password),
            region: self.linkup.region.filter(|r| !r.trim().is_empty()),
            patient_id: self.linkup.patient_id.filter(|p| !p.trim().is_empty()),
            influx: InfluxTarget {
                url,
                org,
                bucket,
                token,
            },
            measurement: self
                .influxdb
                .measurement
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_MEASUREMENT.to_string()),
            sink_max_retries,
            sink_retry_backoff: Duration::from_millis(
                self.influxdb.retry_backoff_ms.unwrap_or(DEFAULT_RETRY_BACKOFF_MS),
            ),
            poll: PollSettings {
                interval,
                backoff_initial,
                backoff_max,
            },
            request_timeout,
        })
    }
}

/// Load the config file (if any), overlay the environment, and validate.
pub fn load_settings(path: Option<&Path>) -> Result<Settings, ConfigError> {
    let mut config = Config::load(path)?;
    config.apply_env()?;
    config.into_settings()
}

fn override_with(slot: &mut Option<String>, value: Option<String>) {
    if value.is_some() {
        *slot = value;
    }
}

fn positive_secs(key: &str, secs: u64) -> Result<Duration, ConfigError> {
    if secs == 0 {
        return Err(ConfigError::Invalid {
            key: key.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(Duration::from_secs(secs))
}
