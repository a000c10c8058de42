//! Runtime configuration for the driver: workers, backoff, rate limiter
//! seeds, storage paths, and browser settings (spec §6.6).
//!
//! Loaded from environment variables first (teacher-style `env_required` /
//! `env_parse_or` / `env_bool` helpers), then optionally overridden by a YAML
//! file passed on the CLI — file values win over defaults, env values win
//! over the file, matching the precedence the teacher's `config_merge.rs`
//! establishes for its own settings.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Configuration errors with descriptive messages.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {var}: {message}")]
    InvalidValue { var: String, message: String },

    #[error("Invalid duration format for {var}: {message}")]
    InvalidDuration { var: String, message: String },

    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    FileParse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Browser-driven fetching configuration (spec §6.6). Unused by the bundled
/// `HttpFetcher`; carried for pluggable browser-driven Fetchers.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct BrowserConfig {
    pub kind: String,
    pub headless: bool,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub locale: String,
    pub timezone: String,
    pub user_agent: Option<String>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            kind: "none".into(),
            headless: true,
            viewport_width: 1280,
            viewport_height: 800,
            locale: "en-US".into(),
            timezone: "UTC".into(),
            user_agent: None,
        }
    }
}

/// Seed state for the adaptive token bucket (spec §4.3).
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimiterConfig {
    pub initial_rate: f64,
    pub min_rate: f64,
    pub max_rate: f64,
    pub bucket_size: f64,
    pub jitter: f64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            initial_rate: 5.0,
            min_rate: 0.1,
            max_rate: 50.0,
            bucket_size: 10.0,
            jitter: 0.25,
        }
    }
}

/// Top-level driver configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub num_workers: usize,
    pub max_workers: usize,
    pub base_delay: Duration,
    pub jitter: f64,
    pub max_backoff_time: Duration,
    pub max_retries: u32,
    pub max_total_backoff: Duration,
    pub storage_dir: PathBuf,
    pub db_path: PathBuf,
    pub resume: bool,
    pub install_signal_handlers: bool,
    pub browser: BrowserConfig,
    pub rate_limiter: RateLimiterConfig,
}

/// Mirror of [`Config`] for YAML deserialization; every field optional so a
/// partial file only overrides what it names.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct ConfigFile {
    num_workers: Option<usize>,
    max_workers: Option<usize>,
    base_delay_secs: Option<f64>,
    jitter: Option<f64>,
    max_backoff_secs: Option<f64>,
    max_retries: Option<u32>,
    max_total_backoff_secs: Option<f64>,
    storage_dir: Option<String>,
    db_path: Option<String>,
    resume: Option<bool>,
    browser: Option<BrowserConfig>,
    rate_limiter: Option<RateLimiterConfig>,
}

fn env_required(name: &str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::MissingEnvVar(name.into()))
}

fn env_parse_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(val) => val.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            var: name.into(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|v| v.to_lowercase() == "true" || v == "1")
        .unwrap_or(default)
}

fn secs(name: &str, value: f64) -> Result<Duration, ConfigError> {
    if value < 0.0 || !value.is_finite() {
        return Err(ConfigError::InvalidValue {
            var: name.into(),
            message: "must be a non-negative finite number of seconds".into(),
        });
    }
    Ok(Duration::from_secs_f64(value))
}

impl Config {
    /// Defaults matching spec §4.5/§4.8 (1 worker, 9-default priority handled
    /// elsewhere, no signal-handler opt-out).
    pub fn defaults() -> Self {
        Self {
            num_workers: 1,
            max_workers: 1,
            base_delay: Duration::from_millis(500),
            jitter: 0.2,
            max_backoff_time: Duration::from_secs(60),
            max_retries: 5,
            max_total_backoff: Duration::from_secs(600),
            storage_dir: PathBuf::from("./storage"),
            db_path: PathBuf::from("./driver.db"),
            resume: false,
            install_signal_handlers: true,
            browser: BrowserConfig::default(),
            rate_limiter: RateLimiterConfig::default(),
        }
    }

    /// Load from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::defaults();

        let num_workers = env_parse_or("NUM_WORKERS", defaults.num_workers)?;
        let max_workers = env_parse_or("MAX_WORKERS", num_workers.max(defaults.max_workers))?;
        let base_delay = secs(
            "BASE_DELAY_SECS",
            env_parse_or("BASE_DELAY_SECS", defaults.base_delay.as_secs_f64())?,
        )?;
        let jitter = env_parse_or("JITTER", defaults.jitter)?;
        let max_backoff_time = secs(
            "MAX_BACKOFF_SECS",
            env_parse_or("MAX_BACKOFF_SECS", defaults.max_backoff_time.as_secs_f64())?,
        )?;
        let max_retries = env_parse_or("MAX_RETRIES", defaults.max_retries)?;
        let max_total_backoff = secs(
            "MAX_TOTAL_BACKOFF_SECS",
            env_parse_or(
                "MAX_TOTAL_BACKOFF_SECS",
                defaults.max_total_backoff.as_secs_f64(),
            )?,
        )?;
        let storage_dir = PathBuf::from(
            env::var("STORAGE_DIR").unwrap_or_else(|_| defaults.storage_dir.display().to_string()),
        );
        let db_path = PathBuf::from(
            env::var("DB_PATH").unwrap_or_else(|_| defaults.db_path.display().to_string()),
        );
        let resume = env_bool("RESUME", defaults.resume);
        let install_signal_handlers =
            env_bool("INSTALL_SIGNAL_HANDLERS", defaults.install_signal_handlers);

        let config = Self {
            num_workers,
            max_workers,
            base_delay,
            jitter,
            max_backoff_time,
            max_retries,
            max_total_backoff,
            storage_dir,
            db_path,
            resume,
            install_signal_handlers,
            browser: defaults.browser,
            rate_limiter: defaults.rate_limiter,
        };
        config.validate()?;
        Ok(config)
    }

    /// Load from environment, then apply a YAML file's values on top of any
    /// field the environment didn't already set explicitly.
    pub fn from_env_and_file(path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let mut config = Self::from_env()?;
        if let Some(path) = path {
            let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
                path: path.display().to_string(),
                source,
            })?;
            let file: ConfigFile =
                serde_yaml::from_str(&raw).map_err(|source| ConfigError::FileParse {
                    path: path.display().to_string(),
                    source,
                })?;
            config.merge_file(file)?;
        }
        config.validate()?;
        Ok(config)
    }

    fn merge_file(&mut self, file: ConfigFile) -> Result<(), ConfigError> {
        if env::var("NUM_WORKERS").is_err() {
            if let Some(v) = file.num_workers {
                self.num_workers = v;
            }
        }
        if env::var("MAX_WORKERS").is_err() {
            if let Some(v) = file.max_workers {
                self.max_workers = v;
            }
        }
        if env::var("BASE_DELAY_SECS").is_err() {
            if let Some(v) = file.base_delay_secs {
                self.base_delay = secs("base_delay_secs", v)?;
            }
        }
        if env::var("JITTER").is_err() {
            if let Some(v) = file.jitter {
                self.jitter = v;
            }
        }
        if env::var("MAX_BACKOFF_SECS").is_err() {
            if let Some(v) = file.max_backoff_secs {
                self.max_backoff_time = secs("max_backoff_secs", v)?;
            }
        }
        if env::var("MAX_RETRIES").is_err() {
            if let Some(v) = file.max_retries {
                self.max_retries = v;
            }
        }
        if env::var("MAX_TOTAL_BACKOFF_SECS").is_err() {
            if let Some(v) = file.max_total_backoff_secs {
                self.max_total_backoff = secs("max_total_backoff_secs", v)?;
            }
        }
        if env::var("STORAGE_DIR").is_err() {
            if let Some(v) = file.storage_dir {
                self.storage_dir = PathBuf::from(v);
            }
        }
        if env::var("DB_PATH").is_err() {
            if let Some(v) = file.db_path {
                self.db_path = PathBuf::from(v);
            }
        }
        if env::var("RESUME").is_err() {
            if let Some(v) = file.resume {
                self.resume = v;
            }
        }
        if let Some(v) = file.browser {
            self.browser = v;
        }
        if let Some(v) = file.rate_limiter {
            self.rate_limiter = v;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.num_workers == 0 {
            return Err(ConfigError::InvalidValue {
                var: "NUM_WORKERS".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.max_workers < self.num_workers {
            return Err(ConfigError::InvalidValue {
                var: "MAX_WORKERS".into(),
                message: "must be >= NUM_WORKERS".into(),
            });
        }
        if self.rate_limiter.min_rate <= 0.0 || self.rate_limiter.max_rate < self.rate_limiter.min_rate
        {
            return Err(ConfigError::InvalidValue {
                var: "rate_limiter".into(),
                message: "min_rate must be > 0 and <= max_rate".into(),
            });
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn for_test() -> Self {
        let mut cfg = Self::defaults();
        cfg.base_delay = Duration::from_millis(1);
        cfg.max_backoff_time = Duration::from_millis(20);
        cfg.install_signal_handlers = false;
        cfg
    }
}
