//! Typed configuration for queues, clients and processors.
//!
//! Every setting is optional and falls back to the defaults below. Settings
//! can be read from a TOML document or from environment variables; both go
//! through the same resolution so the two sources cannot drift apart.
//! The connection URL is wrapped in `secrecy::SecretString` so it never ends
//! up in logs.

use std::path::Path;
use std::time::Duration;

pub use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::error::{Error, Result};

pub const DEFAULT_QUEUE_NAME: &str = "taskq";
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
pub const DEFAULT_RECORD_TTL: Duration = Duration::from_secs(60);

pub const DEFAULT_CLIENT_POLLING_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_millis(10_000);
/// How old a cached result a client accepts by default.
pub const DEFAULT_CACHE_MAX_AGE: Duration = Duration::from_secs(60);

pub const DEFAULT_PROCESSOR_POLLING_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_PREFETCH: usize = 1;
/// How long a processor keeps a cache pointer alive by default.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Component configs
// ---------------------------------------------------------------------------

/// Identity of one logical queue and how to reach its backing store.
#[derive(Debug)]
pub struct QueueConfig {
    /// Prefix for every key of this queue.
    pub name: String,
    pub url: SecretString,
    /// Lifetime of a task record, counted from its first save.
    pub ttl: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_QUEUE_NAME.to_string(),
            url: SecretString::from(DEFAULT_REDIS_URL.to_string()),
            ttl: DEFAULT_RECORD_TTL,
        }
    }
}

impl Clone for QueueConfig {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            url: SecretString::from(self.url.expose_secret().to_string()),
            ttl: self.ttl,
        }
    }
}

/// How long a client waits for a task to settle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    Limited(Duration),
    Unlimited,
}

impl Timeout {
    pub fn duration(self) -> Option<Duration> {
        match self {
            Timeout::Limited(d) => Some(d),
            Timeout::Unlimited => None,
        }
    }
}

impl Default for Timeout {
    fn default() -> Self {
        Timeout::Limited(DEFAULT_CLIENT_TIMEOUT)
    }
}

impl std::str::FromStr for Timeout {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("unlimited") {
            return Ok(Timeout::Unlimited);
        }
        let ms: u64 = s
            .parse()
            .map_err(|_| Error::Config(format!("invalid timeout {s:?}: expected milliseconds or \"unlimited\"")))?;
        Ok(Timeout::Limited(Duration::from_millis(ms)))
    }
}

/// Client-side cache reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientCaching {
    pub enabled: bool,
    /// Oldest cached result the client will reuse.
    pub max_age: Duration,
}

impl Default for ClientCaching {
    fn default() -> Self {
        Self {
            enabled: false,
            max_age: DEFAULT_CACHE_MAX_AGE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub queue: QueueConfig,
    pub polling_interval: Duration,
    pub timeout: Timeout,
    pub caching: ClientCaching,
}

impl ClientConfig {
    pub fn new(queue: QueueConfig) -> Self {
        Self {
            queue,
            polling_interval: DEFAULT_CLIENT_POLLING_INTERVAL,
            timeout: Timeout::default(),
            caching: ClientCaching::default(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

/// Processor-side cache writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorCaching {
    pub enabled: bool,
    /// Lifetime of a cache pointer written after a successful task.
    pub ttl: Duration,
}

impl Default for ProcessorCaching {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl: DEFAULT_CACHE_TTL,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub queue: QueueConfig,
    pub polling_interval: Duration,
    /// Maximum number of tasks executed at once.
    pub prefetch: usize,
    pub caching: ProcessorCaching,
}

impl ProcessorConfig {
    pub fn new(queue: QueueConfig) -> Self {
        Self {
            queue,
            polling_interval: DEFAULT_PROCESSOR_POLLING_INTERVAL,
            prefetch: DEFAULT_PREFETCH,
            caching: ProcessorCaching::default(),
        }
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Fully resolved configuration for one deployment.
#[derive(Debug, Clone)]
pub struct Config {
    pub queue: QueueConfig,
    pub client: ClientConfig,
    pub processor: ProcessorConfig,
    pub otel_endpoint: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    queue: RawQueue,
    #[serde(default)]
    client: RawClient,
    #[serde(default)]
    processor: RawProcessor,
    otel_endpoint: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawQueue {
    name: Option<String>,
    url: Option<String>,
    ttl_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawClient {
    polling_interval_ms: Option<u64>,
    /// Milliseconds, or the string `"unlimited"`.
    timeout: Option<RawTimeout>,
    cache: Option<bool>,
    cache_max_age_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawProcessor {
    polling_interval_ms: Option<u64>,
    prefetch: Option<usize>,
    cache: Option<bool>,
    cache_ttl_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawTimeout {
    Millis(u64),
    Named(String),
}

impl RawTimeout {
    fn resolve(self) -> Result<Timeout> {
        match self {
            RawTimeout::Millis(ms) => Ok(Timeout::Limited(Duration::from_millis(ms))),
            RawTimeout::Named(s) => s.parse(),
        }
    }
}

impl Config {
    /// Parse a TOML document. Missing sections and keys take defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let raw: RawConfig =
            toml::from_str(content).map_err(|e| Error::Config(format!("bad config: {e}")))?;
        raw.resolve()
    }

    /// Read and parse a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read config {}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    /// Load configuration from environment variables.
    ///
    /// `REDIS_URL` is required. In local dev, call `dotenvy::dotenv().ok()`
    /// before this.
    pub fn from_env() -> Result<Self> {
        let raw = RawConfig {
            queue: RawQueue {
                name: optional_var("TASKQ_QUEUE"),
                url: Some(required_var("REDIS_URL")?),
                ttl_secs: parsed_var("TASKQ_TTL_SECS")?,
            },
            client: RawClient {
                polling_interval_ms: parsed_var("TASKQ_CLIENT_POLLING_INTERVAL_MS")?,
                timeout: optional_var("TASKQ_CLIENT_TIMEOUT").map(RawTimeout::Named),
                cache: parsed_var("TASKQ_CLIENT_CACHE")?,
                cache_max_age_secs: parsed_var("TASKQ_CLIENT_CACHE_MAX_AGE_SECS")?,
            },
            processor: RawProcessor {
                polling_interval_ms: parsed_var("TASKQ_PROCESSOR_POLLING_INTERVAL_MS")?,
                prefetch: parsed_var("TASKQ_PROCESSOR_PREFETCH")?,
                cache: parsed_var("TASKQ_PROCESSOR_CACHE")?,
                cache_ttl_secs: parsed_var("TASKQ_PROCESSOR_CACHE_TTL_SECS")?,
            },
            otel_endpoint: optional_var("OTEL_ENDPOINT"),
        };
        raw.resolve()
    }
}

impl RawConfig {
    fn resolve(self) -> Result<Config> {
        let queue = QueueConfig {
            name: self
                .queue
                .name
                .unwrap_or_else(|| DEFAULT_QUEUE_NAME.to_string()),
            url: SecretString::from(
                self.queue
                    .url
                    .unwrap_or_else(|| DEFAULT_REDIS_URL.to_string()),
            ),
            ttl: self
                .queue
                .ttl_secs
                .map_or(DEFAULT_RECORD_TTL, Duration::from_secs),
        };
        if queue.name.is_empty() {
            return Err(Error::Config("queue name must not be empty".to_string()));
        }
        if queue.ttl.is_zero() {
            return Err(Error::Config("queue ttl must be positive".to_string()));
        }

        let client = ClientConfig {
            queue: queue.clone(),
            polling_interval: self
                .client
                .polling_interval_ms
                .map_or(DEFAULT_CLIENT_POLLING_INTERVAL, Duration::from_millis),
            timeout: match self.client.timeout {
                Some(raw) => raw.resolve()?,
                None => Timeout::default(),
            },
            caching: ClientCaching {
                enabled: self.client.cache.unwrap_or(false),
                max_age: self
                    .client
                    .cache_max_age_secs
                    .map_or(DEFAULT_CACHE_MAX_AGE, Duration::from_secs),
            },
        };

        let prefetch = self.processor.prefetch.unwrap_or(DEFAULT_PREFETCH);
        if prefetch == 0 {
            return Err(Error::Config("processor prefetch must be at least 1".to_string()));
        }
        let processor = ProcessorConfig {
            queue: queue.clone(),
            polling_interval: self
                .processor
                .polling_interval_ms
                .map_or(DEFAULT_PROCESSOR_POLLING_INTERVAL, Duration::from_millis),
            prefetch,
            caching: ProcessorCaching {
                enabled: self.processor.cache.unwrap_or(false),
                ttl: self
                    .processor
                    .cache_ttl_secs
                    .map_or(DEFAULT_CACHE_TTL, Duration::from_secs),
            },
        };

        Ok(Config {
            queue,
            client,
            processor,
            otel_endpoint: self.otel_endpoint,
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    optional_var(name)
        .map(|v| {
            v.parse()
                .map_err(|_| Error::Config(format!("environment variable {name} has invalid value {v:?}")))
        })
        .transpose()
}
