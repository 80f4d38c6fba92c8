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
    /// The log level for the proxy.
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
            prefix: "prover_proxy".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Retention of the proof store.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum age of a successful proof before it is removed (item age).
    ///
    /// Failed proofs are removed on the next sweep regardless of their age.
    #[serde(with = "humantime_serde")]
    pub retention: Duration,

    /// How often the background sweep runs.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(3600 * 24 * 7),
            sweep_interval: Duration::from_secs(60 * 10),
        }
    }
}

/// Which of the instance's addresses the prover is reached at.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressType {
    /// The private address inside the VPC.
    Private,
    /// The public address associated with the network interface.
    Public,
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Private => f.write_str("private"),
            Self::Public => f.write_str("public"),
        }
    }
}

/// The prover instance and how to reach the prover running on it.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct ProverConfig {
    /// The AWS region the instance lives in.
    pub region: String,

    /// The EC2 instance id of the prover.
    ///
    /// Defaults to the `PROVER_INSTANCE_ID` environment variable.
    pub instance_id: String,

    /// Which address of the instance to connect to.
    pub address_type: AddressType,

    /// URL scheme of the prover endpoint.
    pub scheme: String,

    /// Port the prover's JSON-RPC server listens on.
    pub port: u16,

    /// The timeout for establishing a connection to the prover.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Backoff between readiness probes while the prover is booting.
    #[serde(with = "humantime_serde")]
    pub readiness_poll_interval: Duration,

    /// Backoff between state checks while waiting for a stopping instance.
    #[serde(with = "humantime_serde")]
    pub state_poll_interval: Duration,
}

impl Default for ProverConfig {
    fn default() -> Self {
        Self {
            region: "ap-northeast-2".to_owned(),
            instance_id: env::var("PROVER_INSTANCE_ID").unwrap_or_default(),
            address_type: AddressType::Private,
            scheme: "http".to_owned(),
            port: 3030,
            connect_timeout: Duration::from_secs(5),
            readiness_poll_interval: Duration::from_secs(1),
            state_poll_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory to persist generated proofs in.
    pub cache_dir: PathBuf,

    /// Host and port to bind the JSON-RPC server to.
    pub bind: String,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// Fine-tune proof retention.
    pub caches: CacheConfig,

    /// The prover instance.
    pub prover: ProverConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: PathBuf::from("./proof"),
            bind: "127.0.0.1:6000".to_owned(),
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            caches: CacheConfig::default(),
            prover: ProverConfig::default(),
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

    /// Checks the settings that are required to run the server.
    pub fn validate(&self) -> Result<()> {
        if self.prover.instance_id.trim().is_empty() {
            anyhow::bail!("`prover.instance_id` or `PROVER_INSTANCE_ID` is required");
        }
        if self.caches.sweep_interval.is_zero() {
            anyhow::bail!("`caches.sweep_interval` must be greater than zero");
        }
        Ok(())
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
