//! Daemon configuration: file parsing, defaults, and per-service overrides.
//!
//! Configuration is a TOML document. Global keys tune the watch modes and
//! the alerting threshold; `[service.<name>]` blocks override behavior for
//! one service; `[handler.<type>.<name>]` blocks declare alert sinks that
//! are addressed elsewhere as `<type>.<name>`.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::state::DEFAULT_KV_ROOT;

/// Default quiescence window, in seconds.
pub const DEFAULT_CHANGE_THRESHOLD_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchMode {
    /// Only subjects registered on the local node.
    Local,
    /// Every subject in the cluster catalog.
    Global,
}

/// Per-service overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Quiescence override, in seconds.
    pub change_threshold: Option<u64>,
    /// Monitor each tag of the service as its own subject.
    pub distinct_tags: bool,
    /// Tags that never get their own monitor.
    pub ignored_tags: Vec<String>,
    /// Sink ids for this service; empty falls back to `default_handlers`.
    pub handlers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StdoutConfig {
    #[serde(default = "default_stdout_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlackConfig {
    pub webhook_url: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PagerdutyConfig {
    pub service_key: String,
    #[serde(default = "default_pagerduty_url")]
    pub url: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

/// A declared alert sink, keyed by `<type>.<name>`.
#[derive(Debug, Clone)]
pub enum SinkConfig {
    Stdout(StdoutConfig),
    Webhook(WebhookConfig),
    Slack(SlackConfig),
    Pagerduty(PagerdutyConfig),
}

fn default_stdout_log_level() -> String {
    "warn".to_string()
}

fn default_max_retries() -> u32 {
    5
}

fn default_pagerduty_url() -> String {
    "https://events.pagerduty.com/v2/enqueue".to_string()
}

fn default_consul_address() -> String {
    "localhost:8500".to_string()
}

fn default_kv_root() -> String {
    DEFAULT_KV_ROOT.to_string()
}

fn default_watch_mode() -> WatchMode {
    WatchMode::Local
}

fn default_change_threshold() -> u64 {
    DEFAULT_CHANGE_THRESHOLD_SECS
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default = "default_consul_address")]
    consul_address: String,
    #[serde(default)]
    consul_token: String,
    #[serde(default)]
    datacenter: Option<String>,
    #[serde(default = "default_kv_root")]
    kv_root: String,
    #[serde(default = "default_watch_mode")]
    node_watch: WatchMode,
    #[serde(default = "default_watch_mode")]
    service_watch: WatchMode,
    #[serde(default = "default_change_threshold")]
    change_threshold: u64,
    #[serde(default)]
    default_handlers: Vec<String>,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default, rename = "service")]
    services: HashMap<String, ServiceConfig>,
    #[serde(default, rename = "handler")]
    handlers: HashMap<String, HashMap<String, toml::Value>>,
}

/// Typed configuration snapshot consumed by the daemon core.
#[derive(Debug, Clone)]
pub struct Config {
    pub consul_address: String,
    pub consul_token: String,
    pub datacenter: Option<String>,
    pub kv_root: String,
    pub node_watch: WatchMode,
    pub service_watch: WatchMode,
    /// Global quiescence window, in seconds.
    pub change_threshold: u64,
    pub default_handlers: Vec<String>,
    pub log_level: String,
    pub services: HashMap<String, ServiceConfig>,
    pub handlers: HashMap<String, SinkConfig>,
}

impl Default for Config {
    /// The zero-config daemon: local watches and a single stdout sink
    /// writing alert lines at warning severity.
    fn default() -> Self {
        let mut handlers = HashMap::new();
        handlers.insert(
            "stdout.default".to_string(),
            SinkConfig::Stdout(StdoutConfig {
                log_level: "warn".to_string(),
            }),
        );
        Config {
            consul_address: default_consul_address(),
            consul_token: String::new(),
            datacenter: None,
            kv_root: default_kv_root(),
            node_watch: WatchMode::Local,
            service_watch: WatchMode::Local,
            change_threshold: DEFAULT_CHANGE_THRESHOLD_SECS,
            default_handlers: Vec::new(),
            log_level: default_log_level(),
            services: HashMap::new(),
            handlers,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("error loading config file: {0}")]
    Io(String),

    #[error("error parsing config: {0}")]
    Parse(String),

    #[error("unknown handler type: {0}")]
    UnknownHandlerType(String),

    #[error("invalid config for handler {0}: {1}")]
    InvalidHandler(String, String),

    #[error("handler {0} is referenced but not declared")]
    UnknownHandlerRef(String),

    #[error("invalid log level: {0}")]
    InvalidLogLevel(String),
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;

        let mut handlers = HashMap::new();
        for (kind, named) in raw.handlers {
            for (name, value) in named {
                let id = format!("{}.{}", kind, name);
                let parsed = match kind.as_str() {
                    "stdout" => value.try_into().map(SinkConfig::Stdout),
                    "webhook" => value.try_into().map(SinkConfig::Webhook),
                    "slack" => value.try_into().map(SinkConfig::Slack),
                    "pagerduty" => value.try_into().map(SinkConfig::Pagerduty),
                    _ => return Err(ConfigError::UnknownHandlerType(kind.clone())),
                };
                let declaration = parsed
                    .map_err(|e| ConfigError::InvalidHandler(id.clone(), e.to_string()))?;
                handlers.insert(id, declaration);
            }
        }

        let config = Config {
            consul_address: raw.consul_address,
            consul_token: raw.consul_token,
            datacenter: raw.datacenter,
            kv_root: raw.kv_root,
            node_watch: raw.node_watch,
            service_watch: raw.service_watch,
            change_threshold: raw.change_threshold,
            default_handlers: raw.default_handlers,
            log_level: raw.log_level,
            services: raw.services,
            handlers,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        const LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
        if !LEVELS.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.log_level.clone()));
        }
        for id in self
            .default_handlers
            .iter()
            .chain(self.services.values().flat_map(|s| s.handlers.iter()))
        {
            if !self.handlers.contains_key(id) {
                return Err(ConfigError::UnknownHandlerRef(id.clone()));
            }
        }
        Ok(())
    }

    pub fn service_config(&self, service: &str) -> Option<&ServiceConfig> {
        self.services.get(service)
    }

    /// The quiescence window for a subject, honoring the per-service
    /// override. Node subjects use the global value.
    pub fn change_threshold_for(&self, service: Option<&str>) -> Duration {
        let secs = service
            .and_then(|s| self.service_config(s))
            .and_then(|s| s.change_threshold)
            .unwrap_or(self.change_threshold);
        Duration::from_secs(secs)
    }

    /// The sink-id filter for a subject: the service's own list, falling
    /// back to `default_handlers`. Empty means "all declared sinks".
    pub fn handler_ids_for(&self, service: Option<&str>) -> Vec<String> {
        if let Some(service_config) = service.and_then(|s| self.service_config(s)) {
            if !service_config.handlers.is_empty() {
                return service_config.handlers.clone();
            }
        }
        self.default_handlers.clone()
    }
}
