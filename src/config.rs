use crate::loader::{DEFAULT_PROGRESS_EVERY, LoadOptions, RetryPolicy};
use serde::{Deserialize, Deserializer};
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const ENV_PREFIX: &str = "BULKLOAD_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0} must not be empty")]
    Missing(&'static str),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn env_var(key: &str) -> Option<String> {
    env::var(format!("{}{}", ENV_PREFIX, key)).ok()
}

fn env_bool(key: &str) -> Option<bool> {
    env_var(key).map(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
}

fn env_usize(key: &str) -> Option<usize> {
    env_var(key).and_then(|value| value.parse::<usize>().ok())
}

/// Accepts the port as either `"5432"` or `5432`.
fn port_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Text(String),
        Number(u64),
    }

    Ok(match Port::deserialize(deserializer)? {
        Port::Text(text) => text,
        Port::Number(number) => number.to_string(),
    })
}

fn default_port() -> String {
    "5432".to_string()
}

fn default_max_idle_conns() -> u32 {
    2
}

fn default_max_open_conns() -> u32 {
    10
}

fn default_total_worker() -> usize {
    num_cpus::get()
}

fn default_progress_every() -> usize {
    DEFAULT_PROGRESS_EVERY
}

fn default_acquire_timeout_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RetryConfig {
    /// `0` retries every failure forever.
    #[serde(default = "RetryConfig::default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "RetryConfig::default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "RetryConfig::default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl RetryConfig {
    fn default_max_attempts() -> u32 {
        5
    }

    fn default_initial_backoff_ms() -> u64 {
        100
    }

    fn default_max_backoff_ms() -> u64 {
        5_000
    }

    pub fn policy(&self) -> RetryPolicy {
        if self.max_attempts == 0 {
            return RetryPolicy::unbounded();
        }
        RetryPolicy::default()
            .with_max_attempts(self.max_attempts)
            .with_backoff(
                Duration::from_millis(self.initial_backoff_ms),
                Duration::from_millis(self.max_backoff_ms),
            )
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: Self::default_max_attempts(),
            initial_backoff_ms: Self::default_initial_backoff_ms(),
            max_backoff_ms: Self::default_max_backoff_ms(),
        }
    }
}

/// Job configuration, loaded from a JSON file.
#[derive(Clone, Deserialize)]
pub struct AppConfig {
    pub db_user: String,
    #[serde(default)]
    pub db_pass: String,
    pub db_address: String,
    #[serde(default = "default_port", deserialize_with = "port_string")]
    pub db_port: String,
    pub db_name: String,
    pub db_table: String,
    #[serde(default = "default_max_idle_conns")]
    pub db_max_idle_conns: u32,
    #[serde(default = "default_max_open_conns")]
    pub db_max_open_conns: u32,
    #[serde(default = "default_total_worker")]
    pub total_worker: usize,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub delimiter: Option<char>,
    #[serde(default)]
    pub reject_file: Option<PathBuf>,
    #[serde(default = "default_progress_every")]
    pub progress_every: usize,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub synchronous_commit: bool,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl AppConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Let `BULKLOAD_*` variables override values from the file.
    pub fn apply_env_overrides(&mut self) {
        if let Some(pass) = env_var("DB_PASS") {
            self.db_pass = pass;
        }
        if let Some(address) = env_var("DB_ADDRESS") {
            self.db_address = address;
        }
        if let Some(table) = env_var("DB_TABLE") {
            self.db_table = table;
        }
        if let Some(workers) = env_usize("TOTAL_WORKER") {
            self.total_worker = workers;
        }
        if let Some(debug) = env_bool("DEBUG") {
            self.debug = debug;
        }
    }

    pub fn validate(&mut self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("db_user", &self.db_user),
            ("db_address", &self.db_address),
            ("db_name", &self.db_name),
            ("db_table", &self.db_table),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Missing(field));
            }
        }

        self.port()?;
        self.delimiter_byte()?;

        if self.total_worker == 0 {
            return Err(ConfigError::Invalid {
                field: "total_worker",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.db_max_open_conns == 0 {
            return Err(ConfigError::Invalid {
                field: "db_max_open_conns",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.db_max_idle_conns > self.db_max_open_conns {
            log::warn!(
                "db_max_idle_conns ({}) exceeds db_max_open_conns ({}); clamping",
                self.db_max_idle_conns,
                self.db_max_open_conns
            );
            self.db_max_idle_conns = self.db_max_open_conns;
        }
        if self.progress_every == 0 {
            self.progress_every = DEFAULT_PROGRESS_EVERY;
        }

        Ok(())
    }

    pub fn port(&self) -> Result<u16, ConfigError> {
        self.db_port
            .trim()
            .parse::<u16>()
            .map_err(|err| ConfigError::Invalid {
                field: "db_port",
                reason: format!("{:?}: {}", self.db_port, err),
            })
    }

    pub fn delimiter_byte(&self) -> Result<u8, ConfigError> {
        match self.delimiter {
            None => Ok(b','),
            Some(c) if c.is_ascii() => Ok(c as u8),
            Some(c) => Err(ConfigError::Invalid {
                field: "delimiter",
                reason: format!("{:?} is not a single ASCII character", c),
            }),
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            workers: self.total_worker,
            retry: self.retry.policy(),
            progress_every: self.progress_every,
        }
    }

    /// Connection target with the password masked, for logging.
    pub fn redacted_url(&self) -> String {
        format!(
            "postgres://{}:***@{}:{}/{}",
            self.db_user, self.db_address, self.db_port, self.db_name
        )
    }
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("db_url", &self.redacted_url())
            .field("db_table", &self.db_table)
            .field("db_max_idle_conns", &self.db_max_idle_conns)
            .field("db_max_open_conns", &self.db_max_open_conns)
            .field("total_worker", &self.total_worker)
            .field("debug", &self.debug)
            .field("reject_file", &self.reject_file)
            .field("retry", &self.retry)
            .finish()
    }
}

impl fmt::Display for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Config:")?;
        writeln!(f, "  db_conn_string: {}", self.redacted_url())?;
        writeln!(f, "  db_max_idle_conns: {}", self.db_max_idle_conns)?;
        writeln!(f, "  db_max_conns: {}", self.db_max_open_conns)?;
        writeln!(f, "  total_worker: {}", self.total_worker)?;
        writeln!(f, "  db_table: {}", self.db_table)?;
        writeln!(f, "  retry_max_attempts: {}", self.retry.max_attempts)?;
        writeln!(f, "  debug: {}", self.debug)?;
        Ok(())
    }
}
