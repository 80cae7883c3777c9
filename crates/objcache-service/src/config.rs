use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

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
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "objcache".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Which filesystem timestamp decides whether an entry is stale.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StalenessSource {
    /// Age is measured from the last access of the entry, falling back to the last modification
    /// when the filesystem does not report access times.
    ///
    /// Entries in active use thus never expire ("time to idle").
    #[default]
    LastAccessed,
    /// Age is measured from the last modification, which is the time the entry was fetched
    /// ("time to live").
    LastModified,
}

/// Retention and capacity policy of a single cache directory.
///
/// The policy is read anew on every cache operation, so changing it only affects operations that
/// start afterwards. Existing files are never rewritten because of a policy change.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Entries older than this are stale and will be fetched again.
    #[serde(with = "humantime_serde")]
    pub retention: Duration,

    /// Maximum number of entries kept on disk.
    ///
    /// `None` means the number of entries is unbounded.
    pub max_entries: Option<u32>,

    /// Which timestamp is used to compute the age of an entry.
    pub staleness_source: StalenessSource,

    /// Trim the cache down to `max_entries` after every newly written entry.
    ///
    /// When disabled, capacity is only enforced by explicit cleanup runs.
    pub enforce_capacity_on_write: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(3600 * 24),
            max_entries: None,
            staleness_source: StalenessSource::default(),
            enforce_capacity_on_write: true,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct InMemoryCacheConfig {
    /// Number of decoded images kept in memory.
    ///
    /// `0` disables the in-memory layer, so every request decodes the cached file.
    ///
    /// Defaults to `100`.
    pub images_capacity: u64,

    /// How long decoded images are kept in memory.
    ///
    /// Defaults to `1h`.
    #[serde(with = "humantime_serde")]
    pub images_ttl: Duration,
}

impl Default for InMemoryCacheConfig {
    fn default() -> Self {
        Self {
            images_capacity: 100,
            images_ttl: Duration::from_secs(3600),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CacheConfigs {
    /// Configure how long downloaded images are cached for.
    pub images: CacheConfig,
    /// Configure how long plain downloaded files are cached for.
    pub files: CacheConfig,
    /// Configuration of the in-memory caches.
    pub in_memory: InMemoryCacheConfig,
}

impl Default for CacheConfigs {
    fn default() -> Self {
        Self {
            images: CacheConfig {
                max_entries: Some(1000),
                ..Default::default()
            },
            files: CacheConfig::default(),
            in_memory: InMemoryCacheConfig::default(),
        }
    }
}

/// Various timeouts for all the downloaders.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DownloadTimeouts {
    /// The timeout for establishing a connection.
    pub connect: Duration,
    /// The timeout for receiving the first headers.
    pub head: Duration,
    /// An adaptive timeout per 1GB of content.
    pub streaming: Duration,
    /// Global timeout for one download.
    pub max_download: Duration,
}

impl DownloadTimeouts {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect: config.connect_timeout,
            head: config.head_timeout,
            streaming: config.streaming_timeout,
            max_download: config.max_download_timeout,
        }
    }
}

impl Default for DownloadTimeouts {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base directory of all caches.
    ///
    /// Every cache gets its own subdirectory, which is created lazily on first write.
    pub cache_dir: PathBuf,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// Fine-tune cache expiry and capacity.
    pub caches: CacheConfigs,

    /// The maximum timeout for downloads.
    #[serde(with = "humantime_serde")]
    pub max_download_timeout: Duration,

    /// The timeout for establishing a connection in a download.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// The timeout for receiving the response headers of a download.
    #[serde(with = "humantime_serde")]
    pub head_timeout: Duration,

    /// The timeout per GB for streaming downloads.
    ///
    /// For downloads with a known size, this timeout applies on top of the head timeout. If the
    /// download size is not known, only `max_download_timeout` applies.
    #[serde(with = "humantime_serde")]
    pub streaming_timeout: Duration,

    /// Number of jobs that can be queued on a serial execution context before it starts
    /// rejecting work.
    pub serial_queue_size: usize,
}

impl Config {
    /// Return a cache directory `dir`, joined with the configured base cache directory.
    pub fn cache_dir<P>(&self, dir: P) -> PathBuf
    where
        P: AsRef<Path>,
    {
        self.cache_dir.join(dir)
    }
}

/// Default value for the "cache_dir" configuration.
fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(env::temp_dir)
        .join("objcache")
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: default_cache_dir(),
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            caches: CacheConfigs::default(),
            max_download_timeout: Duration::from_secs(5 * 60),
            connect_timeout: Duration::from_secs(1),
            head_timeout: Duration::from_secs(5),
            // Allow a 4MB/s connection to download 1GB without timing out.
            streaming_timeout: Duration::from_secs(250),
            serial_queue_size: 1024,
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
        serde_yaml::from_str(&config).context("failed to parse config YAML")
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
    fn test_cache_config() {
        // It should be possible to set individual caches in reasonable units without
        // affecting other caches' default values.
        let cfg = Config::get(None).unwrap();
        assert_eq!(cfg.caches.images.retention, Duration::from_secs(3600 * 24));
        assert_eq!(cfg.caches.images.max_entries, Some(1000));

        let yaml = r#"
            caches:
              images:
                retention: 1h
                staleness_source: last_modified
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.caches.images.retention, Duration::from_secs(3600));
        assert_eq!(
            cfg.caches.images.staleness_source,
            StalenessSource::LastModified
        );
        // fields of a partially configured cache fall back to the generic default
        assert_eq!(cfg.caches.images.max_entries, None);
        assert!(cfg.caches.images.enforce_capacity_on_write);

        assert_eq!(cfg.caches.files, CacheConfig::default());
    }

    #[test]
    fn test_capacity_config() {
        let yaml = r#"
            caches:
              files:
                max_entries: 10
                enforce_capacity_on_write: false
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.caches.files.max_entries, Some(10));
        assert!(!cfg.caches.files.enforce_capacity_on_write);
        assert_eq!(
            cfg.caches.files.staleness_source,
            StalenessSource::LastAccessed
        );
    }

    #[test]
    fn test_in_memory_config() {
        let yaml = r#"
            caches:
              in_memory:
                images_capacity: 0
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.caches.in_memory.images_capacity, 0);
        assert_eq!(cfg.caches.in_memory.images_ttl, Duration::from_secs(3600));
    }

    #[test]
    fn test_cache_dir() {
        let yaml = r#"
            cache_dir: /tmp/objcache-test
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(
            cfg.cache_dir("images"),
            Path::new("/tmp/objcache-test/images")
        );
    }

    #[test]
    fn test_zero_second_dl_timeouts() {
        // 0s download timeouts will not be set to defaults
        let yaml = r#"
            max_download_timeout: 0s
            connect_timeout: 0s
            streaming_timeout: 0s
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        let timeouts = DownloadTimeouts::from_config(&cfg);
        assert_eq!(timeouts.max_download, Duration::from_secs(0));
        assert_eq!(timeouts.connect, Duration::from_secs(0));
        assert_eq!(timeouts.streaming, Duration::from_secs(0));
        assert_eq!(timeouts.head, Duration::from_secs(5));
    }

    #[test]
    fn test_log_level() {
        let yaml = r#"
            logging:
              level: debug
              format: json
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert_eq!(cfg.logging.format, LogFormat::Json);

        let yaml = r#"
            logging:
              level: loud
        "#;
        assert!(Config::from_reader(yaml.as_bytes()).is_err());
    }

    #[test]
    fn test_unknown_fields() {
        // Unknown fields should not cause failure
        let yaml = r#"
            caches:
              not_a_cache:
                retention: 1h
        "#;
        let cfg = Config::from_reader(yaml.as_bytes());
        assert!(cfg.is_ok());
    }

    #[test]
    fn test_empty_file() {
        // Empty files aren't supported
        let yaml = r#""#;
        let result = Config::from_reader(yaml.as_bytes());
        assert!(result.is_err());
    }
}
