use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;
use url::Url;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "blobcache".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Controls how failed fetches are retried.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// The total number of fetch attempts per resolution, including the first one.
    ///
    /// Defaults to `3`.
    pub max_attempts: usize,

    /// How long a failed fetch waits for an update notification of its object before giving up.
    ///
    /// `null` waits indefinitely. Defaults to `60s`.
    #[serde(with = "humantime_serde")]
    pub update_wait_timeout: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            update_wait_timeout: Some(Duration::from_secs(60)),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct InMemoryCacheConfig {
    /// Capacity (in bytes) for the in-memory blob cache.
    ///
    /// Blobs are evicted, and their object URLs revoked, once the total size of cached blobs
    /// exceeds this limit.
    ///
    /// Defaults to `256 MiB (= 268_435_456)`.
    pub blob_capacity: u64,

    /// Maximum duration since last use of a cached blob.
    ///
    /// Defaults to `null`, keeping blobs until they are deleted or pushed out by the capacity.
    #[serde(with = "humantime_serde")]
    pub max_unused_for: Option<Duration>,
}

impl Default for InMemoryCacheConfig {
    fn default() -> Self {
        Self {
            blob_capacity: 256 * 1024 * 1024,
            max_unused_for: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
pub struct CacheConfigs {
    /// Configuration of the in-memory blob cache.
    pub in_memory: InMemoryCacheConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL that relative resource URLs are resolved against.
    pub api_url: Option<Url>,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// Fine-tune the caches.
    pub caches: CacheConfigs,

    /// Fine-tune retries of failed fetches.
    pub retries: RetryConfig,

    /// The number of update events buffered per subscriber.
    pub event_channel_capacity: usize,

    /// The maximum timeout for a single fetch attempt.
    #[serde(with = "humantime_serde")]
    pub max_download_timeout: Duration,

    /// The timeout for establishing a connection in a fetch attempt.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// The timeout for receiving the response headers of a fetch attempt.
    #[serde(with = "humantime_serde")]
    pub head_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            api_url: None,
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            caches: CacheConfigs::default(),
            retries: RetryConfig::default(),
            event_channel_capacity: 512,
            max_download_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(1),
            head_timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        let config: Self = serde_yaml::from_str(&config).context("failed to parse config YAML")?;
        if config.event_channel_capacity == 0 {
            anyhow::bail!("event_channel_capacity must be at least 1");
        }
        Ok(config)
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::get(None).unwrap();
        assert_eq!(cfg.retries.max_attempts, 3);
        assert_eq!(
            cfg.retries.update_wait_timeout,
            Some(Duration::from_secs(60))
        );
        assert_eq!(cfg.caches.in_memory, InMemoryCacheConfig::default());
        assert!(cfg.api_url.is_none());
    }

    #[test]
    fn test_partial_config() {
        let yaml = r#"
            api_url: https://api.example.com/
            logging:
              level: debug
              format: json
            retries:
              update_wait_timeout: 5m
            caches:
              in_memory:
                max_unused_for: 1h
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.api_url.unwrap().as_str(), "https://api.example.com/");
        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert_eq!(cfg.logging.format, LogFormat::Json);
        assert_eq!(cfg.retries.max_attempts, 3);
        assert_eq!(
            cfg.retries.update_wait_timeout,
            Some(Duration::from_secs(300))
        );
        assert_eq!(
            cfg.caches.in_memory.max_unused_for,
            Some(Duration::from_secs(3600))
        );
        assert_eq!(
            cfg.caches.in_memory.blob_capacity,
            InMemoryCacheConfig::default().blob_capacity
        );
    }

    #[test]
    fn test_unbounded_update_wait() {
        // It should be possible to set the wait to `None` meaning "wait forever".
        let yaml = r#"
            retries:
              update_wait_timeout: null
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.retries.update_wait_timeout, None);
        assert_eq!(cfg.retries.max_attempts, 3);
    }

    #[test]
    fn test_zero_second_dl_timeouts() {
        // 0s download timeouts will not be set to defaults
        let yaml = r#"
            max_download_timeout: 0s
            connect_timeout: 0s
            head_timeout: 0s
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.max_download_timeout, Duration::from_secs(0));
        assert_eq!(cfg.connect_timeout, Duration::from_secs(0));
        assert_eq!(cfg.head_timeout, Duration::from_secs(0));
    }

    #[test]
    fn test_unknown_fields() {
        // Unknown fields should not cause failure
        let yaml = r#"
            caches:
              not_a_cache:
                max_unused_for: 1h
        "#;
        let cfg = Config::from_reader(yaml.as_bytes());
        assert!(cfg.is_ok());
    }

    #[test]
    fn test_invalid_level() {
        let yaml = r#"
            logging:
              level: loud
        "#;
        assert!(Config::from_reader(yaml.as_bytes()).is_err());
    }

    #[test]
    fn test_empty_file() {
        // Empty files aren't supported
        let yaml = r#""#;
        let result = Config::from_reader(yaml.as_bytes());
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_event_channel_capacity() {
        let yaml = r#"
            event_channel_capacity: 0
        "#;
        let err = Config::from_reader(yaml.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("event_channel_capacity"));
    }
}
