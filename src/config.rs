// Settings for the sync worker, loaded and validated once at startup

use std::{collections::HashSet, env, fs, path::Path, path::PathBuf, time::Duration};

use reqwest::Url;
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("missing environment variable {0}")]
    MissingEnv(&'static str),

    #[error("environment variable {name} has an invalid value {value:?}")]
    InvalidEnv { name: &'static str, value: String },

    #[error("provider name must not be empty")]
    EmptyProviderName,

    #[error("provider {0:?} is configured more than once")]
    DuplicateProvider(String),

    #[error("provider {name:?} has an invalid url {url:?}: {reason}")]
    InvalidUrl {
        name: String,
        url: String,
        reason: String,
    },

    #[error("provider {0:?} must have a timeout greater than zero")]
    ZeroTimeout(String),

    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),
}

/// One upstream XML feed.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub url: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>, url: impl Into<String>, timeout_seconds: u64) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            timeout_seconds,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

// Retry policy for transient fetch failures
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 300,
            max_backoff_ms: 10000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub batch_size: usize,
    pub lock_ttl_seconds: u64,
    pub parallel: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            lock_ttl_seconds: 3600,
            parallel: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub ttl_seconds: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self { ttl_seconds: 300 }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Settings {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub cache: CacheSettings,
}

fn default_timeout_seconds() -> u64 {
    10
}

fn default_database_path() -> PathBuf {
    PathBuf::from("events.db")
}

fn default_pool_size() -> u32 {
    8
}

impl Settings {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let settings: Settings = toml::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Single-provider deployment driven only by environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let url = env::var("PROVIDER_API_URL").map_err(|_| ConfigError::MissingEnv("PROVIDER_API_URL"))?;
        let name = env::var("PROVIDER_NAME").unwrap_or_else(|_| "primary_provider".to_string());
        let timeout_seconds = match env::var("PROVIDER_API_TIMEOUT") {
            Ok(value) => value.trim().parse::<u64>().map_err(|_| ConfigError::InvalidEnv {
                name: "PROVIDER_API_TIMEOUT",
                value,
            })?,
            Err(_) => default_timeout_seconds(),
        };
        let database_path = env::var("DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_database_path());

        let settings = Settings {
            database_path,
            pool_size: default_pool_size(),
            providers: vec![ProviderConfig::new(name, url, timeout_seconds)],
            sync: SyncSettings::default(),
            retry: RetryConfig::default(),
            cache: CacheSettings::default(),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for provider in &self.providers {
            if provider.name.trim().is_empty() {
                return Err(ConfigError::EmptyProviderName);
            }
            if !seen.insert(provider.name.as_str()) {
                return Err(ConfigError::DuplicateProvider(provider.name.clone()));
            }
            validate_url(provider)?;
            if provider.timeout_seconds == 0 {
                return Err(ConfigError::ZeroTimeout(provider.name.clone()));
            }
        }

        if self.sync.batch_size == 0 {
            return Err(ConfigError::ZeroValue("sync.batch_size"));
        }
        if self.sync.lock_ttl_seconds == 0 {
            return Err(ConfigError::ZeroValue("sync.lock_ttl_seconds"));
        }
        if self.pool_size == 0 {
            return Err(ConfigError::ZeroValue("pool_size"));
        }

        Ok(())
    }
}

fn validate_url(provider: &ProviderConfig) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidUrl {
        name: provider.name.clone(),
        url: provider.url.clone(),
        reason,
    };

    let url = Url::parse(&provider.url).map_err(|e| invalid(e.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(invalid(format!("unsupported scheme {other:?}"))),
    }
}
