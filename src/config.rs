use anyhow::{Context, Result};
use relay_core::{QueryOptions, StoreOptions};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file read when `--config` is not given. Missing is fine.
pub const DEFAULT_CONFIG_PATH: &str = "snowrelay.toml";

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_cache_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct IngestConfig {
    /// Reject events whose id is not the hash of their content.
    #[serde(default)]
    pub verify_event_id: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_per_second")]
    pub per_second: u32,
    #[serde(default = "default_burst")]
    pub burst: u32,
    /// Take the client address from `X-Real-IP` / `X-Forwarded-For`.
    /// Only safe behind a proxy that sets them.
    #[serde(default)]
    pub trust_proxy_headers: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            request_timeout_secs: default_request_timeout_secs(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            pool_size: default_pool_size(),
            timeout_ms: default_store_timeout_ms(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            ttl_secs: default_cache_ttl_secs(),
            timeout_ms: default_cache_timeout_ms(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            per_second: default_per_second(),
            burst: default_burst(),
            trust_proxy_headers: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_bind_address() -> String {
    "127.0.0.1:8008".to_string()
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_max_body_bytes() -> usize {
    64 * 1024
}

fn default_db_path() -> String {
    "relay.db".to_string()
}

fn default_pool_size() -> usize {
    4
}

fn default_store_timeout_ms() -> u64 {
    5000
}

fn default_busy_timeout_ms() -> u64 {
    3000
}

fn default_cache_capacity() -> usize {
    relay_core::cache::DEFAULT_CACHE_CAPACITY
}

fn default_cache_ttl_secs() -> u64 {
    relay_core::query::DEFAULT_CACHE_TTL.as_secs()
}

fn default_cache_timeout_ms() -> u64 {
    250
}

fn default_true() -> bool {
    true
}

fn default_per_second() -> u32 {
    1
}

fn default_burst() -> u32 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

impl Config {
    /// Load `path`, or [`DEFAULT_CONFIG_PATH`] if it exists, or defaults.
    /// Environment overrides and path expansion are applied in every case.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => Self::load_from_file(DEFAULT_CONFIG_PATH)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.expand_paths();
        Ok(config)
    }

    pub fn load_from_file(path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(path);
        let content = fs::read_to_string(expanded_path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).with_context(|| "Failed to parse TOML config")
    }

    /// `SNOWRELAY_DB_PATH` and `SNOWRELAY_BIND` take precedence over the file.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(db_path) = lookup("SNOWRELAY_DB_PATH").filter(|v| !v.is_empty()) {
            self.store.db_path = db_path;
        }
        if let Some(bind) = lookup("SNOWRELAY_BIND").filter(|v| !v.is_empty()) {
            self.server.bind = bind;
        }
    }

    pub fn expand_paths(&mut self) {
        self.store.db_path = shellexpand::tilde(&self.store.db_path).to_string();
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.bind.parse::<SocketAddr>().is_err() {
            anyhow::bail!("Invalid bind address: {}", self.server.bind);
        }
        if self.server.request_timeout_secs == 0 {
            anyhow::bail!("server.request_timeout_secs must be at least 1");
        }
        if self.server.max_body_bytes == 0 {
            anyhow::bail!("server.max_body_bytes must be positive");
        }
        if self.store.db_path.trim().is_empty() {
            anyhow::bail!("store.db_path must not be empty");
        }
        if self.store.pool_size == 0 {
            anyhow::bail!("store.pool_size must be at least 1");
        }
        if self.store.timeout_ms == 0 {
            anyhow::bail!("store.timeout_ms must be positive");
        }
        if self.cache.capacity == 0 {
            anyhow::bail!("cache.capacity must be at least 1");
        }
        if self.cache.ttl_secs == 0 {
            anyhow::bail!("cache.ttl_secs must be at least 1");
        }
        if self.rate_limit.enabled && (self.rate_limit.per_second == 0 || self.rate_limit.burst == 0) {
            anyhow::bail!("rate_limit.per_second and rate_limit.burst must be positive when enabled");
        }
        if !LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Unknown log level '{}' (expected one of {})",
                self.logging.level,
                LOG_LEVELS.join(", ")
            );
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.server
            .bind
            .parse()
            .with_context(|| format!("Invalid bind address: {}", self.server.bind))
    }

    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(&self.store.db_path)
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            pool_size: self.store.pool_size,
            timeout: Duration::from_millis(self.store.timeout_ms),
            busy_timeout: Duration::from_millis(self.store.busy_timeout_ms),
        }
    }

    pub fn query_options(&self) -> QueryOptions {
        QueryOptions {
            cache_ttl: Duration::from_secs(self.cache.ttl_secs),
            cache_timeout: Duration::from_millis(self.cache.timeout_ms),
        }
    }
}
