//! # Configuration Management Module
//!
//! Configuration for the worker process: broker coordinates, the parent RPC
//! endpoint, sampling policy defaults, eventlog target and plugin search
//! settings. Loaded from a TOML file with environment variable overrides and
//! validated before the worker starts.
//!
//! ## Configuration File Example
//!
//! ```toml
//! [broker]
//! url = "redis://localhost:6379"
//! queue = "zmon:queue:default"
//! pop_timeout = "5s"
//! retry_backoff = "5s"
//!
//! [rpc_server]
//! host = "localhost"
//! port = 8500
//! rpc_path = "/zmon_rpc"
//!
//! [sampling]
//! rate = 100
//! critical_checks = [13, 14, 19]
//! update_rate = "60s"
//! zmon_url = "https://zmon.example.org"
//!
//! [eventlog]
//! host = "localhost"
//! port = 8081
//! http = false
//!
//! [plugins]
//! additional_dirs = ["/opt/zmon/plugins"]
//!
//! [plugins.global_config]
//! "plugin.http.timeout" = "10"
//! ```
//!
//! ## Environment Variables
//!
//! - `WORKER_BROKER_URL`: override the broker url
//! - `WORKER_QUEUE`: override the queue name
//! - `WORKER_LOG_LEVEL`: override the log level
//! - `ZMON_TOKEN`: bearer token for the sampling entity endpoint
//! - `ZMON_PLUGINS`: colon-separated plugin search paths (read by the
//!   plugin registry, not by this module)

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level worker configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub rpc_server: RpcServerConfig,
    #[serde(default)]
    pub sampling: SamplingSettings,
    #[serde(default)]
    pub eventlog: EventLogConfig,
    #[serde(default)]
    pub plugins: PluginSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Broker queue coordinates and loop pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Redis connection url
    pub url: String,
    /// Queue the worker drains
    pub queue: String,
    /// Blocking pop timeout; an empty pop is an idle loop, not an error
    #[serde(with = "duration_serde", default = "default_pop_timeout")]
    pub pop_timeout: Duration,
    /// Sleep between retries after broker or decode failures
    #[serde(with = "duration_serde", default = "default_retry_backoff")]
    pub retry_backoff: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            queue: "zmon:queue:default".to_string(),
            pop_timeout: Duration::from_secs(5),
            retry_backoff: Duration::from_secs(5),
        }
    }
}

/// Parent supervisor RPC endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcServerConfig {
    pub host: String,
    pub port: u16,
    pub rpc_path: String,
}

impl RpcServerConfig {
    pub fn endpoint(&self) -> String {
        format!("http://{}:{}{}", self.host, self.port, self.rpc_path)
    }
}

impl Default for RpcServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8500,
            rpc_path: "/zmon_rpc".to_string(),
        }
    }
}

/// Sampling policy defaults and the entity refresh endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingSettings {
    /// Default sampling rate in percent
    pub rate: u32,
    /// Checks that are always sampled; accepts a list of ids or a
    /// comma-separated string
    #[serde(default, deserialize_with = "de_critical_checks")]
    pub critical_checks: Vec<i64>,
    /// Minimum time between refresh attempts
    #[serde(with = "duration_serde", default = "default_update_rate")]
    pub update_rate: Duration,
    /// Base url of the ZMON API serving the sampling entity; refresh is
    /// skipped entirely when unset
    #[serde(default)]
    pub zmon_url: Option<String>,
    /// Bearer token for the entity endpoint
    #[serde(default)]
    pub token: Option<String>,
}

impl Default for SamplingSettings {
    fn default() -> Self {
        Self {
            rate: 100,
            critical_checks: Vec::new(),
            update_rate: Duration::from_secs(60),
            zmon_url: None,
            token: None,
        }
    }
}

/// Eventlog collaborator target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogConfig {
    pub host: String,
    pub port: u16,
    /// Ship entries over HTTP; when false entries are only debug-logged
    pub http: bool,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8081,
            http: false,
        }
    }
}

/// Plugin discovery settings handed to the registry at collection time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginSettings {
    /// Directories scanned after builtins and `ZMON_PLUGINS`
    #[serde(default)]
    pub additional_dirs: Vec<PathBuf>,
    /// Host configuration; `plugin.<name>.<key>` entries override plugin
    /// manifests
    #[serde(default)]
    pub global_config: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: WorkerConfig = toml::from_str(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` when it exists, otherwise start from defaults.
    /// Environment overrides and validation apply either way.
    pub fn load_or_default(path: &str) -> anyhow::Result<Self> {
        if Path::new(path).exists() {
            Self::load(path)
        } else {
            tracing::warn!(path, "config file not found, using defaults");
            let mut config = Self::default();
            config.apply_env_overrides()?;
            config.validate()?;
            Ok(config)
        }
    }

    pub fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        if let Ok(url) = env::var("WORKER_BROKER_URL") {
            if !url.is_empty() {
                self.broker.url = url;
            }
        }
        if let Ok(queue) = env::var("WORKER_QUEUE") {
            if !queue.is_empty() {
                self.broker.queue = queue;
            }
        }
        if let Ok(level) = env::var("WORKER_LOG_LEVEL") {
            let valid_levels = ["trace", "debug", "info", "warn", "error"];
            if valid_levels.contains(&level.as_str()) {
                self.logging.level = level;
            } else {
                return Err(anyhow::anyhow!(
                    "Invalid log level: {}. Use: {:?}",
                    level,
                    valid_levels
                ));
            }
        }
        if let Ok(token) = env::var("ZMON_TOKEN") {
            if !token.is_empty() {
                self.sampling.token = Some(token);
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.broker.url.is_empty() {
            return Err(anyhow::anyhow!("Broker url cannot be empty"));
        }
        if !self.broker.url.starts_with("redis://") && !self.broker.url.starts_with("rediss://") {
            return Err(anyhow::anyhow!(
                "Broker url must start with redis:// or rediss://, got {}",
                self.broker.url
            ));
        }
        if self.broker.queue.is_empty() {
            return Err(anyhow::anyhow!("Queue name cannot be empty"));
        }
        if self.broker.pop_timeout.as_secs() == 0 {
            return Err(anyhow::anyhow!("Broker pop timeout cannot be below 1s"));
        }
        if self.sampling.rate > 100 {
            return Err(anyhow::anyhow!(
                "Sampling rate must be between 0 and 100, got {}",
                self.sampling.rate
            ));
        }
        if self.sampling.update_rate.as_secs() == 0 {
            return Err(anyhow::anyhow!("Sampling update rate cannot be 0"));
        }
        if let Some(url) = &self.sampling.zmon_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(anyhow::anyhow!("Invalid zmon_url format: {}", url));
            }
        }
        if self.rpc_server.host.is_empty() {
            return Err(anyhow::anyhow!("RPC server host cannot be empty"));
        }
        if !self.rpc_server.rpc_path.starts_with('/') {
            return Err(anyhow::anyhow!(
                "RPC path must start with '/', got {}",
                self.rpc_server.rpc_path
            ));
        }
        Ok(())
    }
}

fn default_pop_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_retry_backoff() -> Duration {
    Duration::from_secs(5)
}

fn default_update_rate() -> Duration {
    Duration::from_secs(60)
}

fn de_critical_checks<'de, D>(deserializer: D) -> Result<Vec<i64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ListOrString {
        List(Vec<i64>),
        Text(String),
    }

    match ListOrString::deserialize(deserializer)? {
        ListOrString::List(ids) => Ok(ids),
        ListOrString::Text(text) => text
            .replace(' ', "")
            .split(',')
            .filter(|part| !part.is_empty())
            .map(|part| part.parse::<i64>().map_err(serde::de::Error::custom))
            .collect(),
    }
}

/// Duration fields rendered as strings like "200ms", "5s", "1m", "2h".
pub mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis();
        if millis % 1000 == 0 {
            serializer.serialize_str(&format!("{}s", millis / 1000))
        } else {
            serializer.serialize_str(&format!("{millis}ms"))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        parse_duration(&text).map_err(serde::de::Error::custom)
    }

    pub fn parse_duration(text: &str) -> anyhow::Result<Duration> {
        let text = text.trim();
        let (number, unit) = text
            .find(|c: char| !c.is_ascii_digit())
            .map(|idx| text.split_at(idx))
            .ok_or_else(|| anyhow::anyhow!("missing duration unit in {:?}", text))?;
        let value: u64 = number
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid duration value in {:?}", text))?;
        match unit {
            "ms" => Ok(Duration::from_millis(value)),
            "s" => Ok(Duration::from_secs(value)),
            "m" => Ok(Duration::from_secs(value * 60)),
            "h" => Ok(Duration::from_secs(value * 3600)),
            _ => Err(anyhow::anyhow!("unknown duration unit {:?}", unit)),
        }
    }
}
