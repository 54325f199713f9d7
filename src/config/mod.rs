//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or a
//! tunable does not parse. Relay tunables may also come from a TOML file;
//! environment variables win over file values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub relay: RelaySettings,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(RelaySettings::default())
    }

    /// Like [`Config::from_env`], layering env overrides on `relay`.
    pub fn from_env_with(relay: RelaySettings) -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            relay: relay.with_env_overrides()?,
        })
    }
}

/// Admission and transport tunables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Ceiling on outstanding jobs in the registry.
    pub max_queue_depth: usize,
    /// Per-job deadline.
    pub job_timeout_ms: u64,
    /// Ceiling on payload bytes admitted but not yet resolved.
    pub max_in_flight_bytes: u64,
    /// Fallback wake-up for both admission gates.
    pub poll_interval_ms: u64,
    /// Messages at or above this size are offloaded to blob storage.
    pub max_message_bytes: usize,
    /// Reply topic tag stamped on every outbound message.
    pub topic: String,
    pub blob_dir: PathBuf,
    /// Processor names served by the binary.
    pub processors: Vec<String>,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            max_queue_depth: 600,
            job_timeout_ms: 5 * 60 * 1000,
            max_in_flight_bytes: 1024 * 1024 * 200,
            poll_interval_ms: 2000,
            max_message_bytes: 1024 * 1024 * 5,
            topic: "workrelay".to_string(),
            blob_dir: PathBuf::from(".cache/workrelay-blobs"),
            processors: Vec::new(),
        }
    }
}

impl RelaySettings {
    /// Read settings from a TOML file. Missing keys take defaults.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read settings {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
            .map_err(|e| Error::Config(format!("bad settings {}: {e}", path.display())))
    }

    pub fn from_toml_str(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Apply `WORKRELAY_*` environment overrides.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Some(v) = parsed_var("WORKRELAY_MAX_QUEUE_DEPTH")? {
            self.max_queue_depth = v;
        }
        // PARALLEL_RUNNER_TIMEOUT is the historical name for the job timeout.
        if let Some(v) = parsed_var("PARALLEL_RUNNER_TIMEOUT")? {
            self.job_timeout_ms = v;
        }
        if let Some(v) = parsed_var("WORKRELAY_JOB_TIMEOUT_MS")? {
            self.job_timeout_ms = v;
        }
        if let Some(v) = parsed_var("WORKRELAY_MAX_IN_FLIGHT_BYTES")? {
            self.max_in_flight_bytes = v;
        }
        if let Some(v) = parsed_var("WORKRELAY_POLL_INTERVAL_MS")? {
            self.poll_interval_ms = v;
        }
        if let Some(v) = parsed_var("WORKRELAY_MAX_MESSAGE_BYTES")? {
            self.max_message_bytes = v;
        }
        if let Ok(v) = std::env::var("WORKRELAY_TOPIC") {
            self.topic = v;
        }
        if let Ok(v) = std::env::var("WORKRELAY_BLOB_DIR") {
            self.blob_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("WORKRELAY_PROCESSORS") {
            self.processors = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        Ok(self)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("{name}={raw:?} is invalid: {e}"))),
        Err(_) => Ok(None),
    }
}
