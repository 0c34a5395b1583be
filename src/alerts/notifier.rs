//! Alert sinks: delivery of notifications to external endpoints.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{
    Config, PagerdutyConfig, SinkConfig, SlackConfig, StdoutConfig, WebhookConfig,
};
use crate::health::HealthStatus;
use crate::state::AlertState;

/// Delay between delivery attempts of a remote sink.
const RETRY_WAIT: Duration = Duration::from_secs(1);

/// An external notification channel capable of accepting an alert.
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Identifier the sink was registered under (`<type>.<name>`).
    fn id(&self) -> &str;

    async fn emit(&self, datacenter: &str, alert: &AlertState) -> Result<(), SinkError>;
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("network error: {0}")]
    Network(String),

    #[error("remote error: {0}")]
    Remote(String),
}

/// Sink that writes the alert message and details as log lines.
pub struct StdoutSink {
    id: String,
    log_level: String,
}

impl StdoutSink {
    pub fn new(id: impl Into<String>, config: StdoutConfig) -> Self {
        Self {
            id: id.into(),
            log_level: config.log_level.to_lowercase(),
        }
    }

    fn log(&self, line: &str) {
        match self.log_level.as_str() {
            "error" => tracing::error!("{}", line),
            "info" => tracing::info!("{}", line),
            "debug" => tracing::debug!("{}", line),
            _ => tracing::warn!("{}", line),
        }
    }
}

#[async_trait]
impl AlertSink for StdoutSink {
    fn id(&self) -> &str {
        &self.id
    }

    async fn emit(&self, _datacenter: &str, alert: &AlertState) -> Result<(), SinkError> {
        self.log(&alert.message);
        for line in alert.details.lines() {
            self.log(line);
        }
        Ok(())
    }
}

/// Generic JSON webhook sink.
pub struct WebhookSink {
    id: String,
    url: String,
    headers: HashMap<String, String>,
    max_retries: u32,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(id: impl Into<String>, config: WebhookConfig) -> Self {
        Self {
            id: id.into(),
            url: config.url,
            headers: config.headers,
            max_retries: config.max_retries,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl AlertSink for WebhookSink {
    fn id(&self) -> &str {
        &self.id
    }

    async fn emit(&self, datacenter: &str, alert: &AlertState) -> Result<(), SinkError> {
        let payload = serde_json::json!({
            "status": alert.status,
            "node": alert.node,
            "service": alert.service,
            "tag": alert.tag,
            "datacenter": datacenter,
            "message": alert.message,
            "details": alert.details,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        send_with_retries(&self.id, self.max_retries, || {
            let mut request = self.client.post(&self.url).json(&payload);
            for (key, value) in &self.headers {
                request = request.header(key, value);
            }
            request
        })
        .await
    }
}

/// Slack incoming-webhook sink.
pub struct SlackSink {
    id: String,
    webhook_url: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl SlackSink {
    pub fn new(id: impl Into<String>, config: SlackConfig) -> Self {
        Self {
            id: id.into(),
            webhook_url: config.webhook_url,
            max_retries: config.max_retries,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl AlertSink for SlackSink {
    fn id(&self) -> &str {
        &self.id
    }

    async fn emit(&self, _datacenter: &str, alert: &AlertState) -> Result<(), SinkError> {
        let text = if alert.details.is_empty() {
            alert.message.clone()
        } else {
            format!("{}\n```{}```", alert.message, alert.details)
        };
        let payload = serde_json::json!({ "text": text });
        send_with_retries(&self.id, self.max_retries, || {
            self.client.post(&self.webhook_url).json(&payload)
        })
        .await
    }
}

/// PagerDuty events sink. A recovery to `passing` resolves the incident
/// keyed by the subject instead of opening a new one.
pub struct PagerdutySink {
    id: String,
    service_key: String,
    url: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl PagerdutySink {
    pub fn new(id: impl Into<String>, config: PagerdutyConfig) -> Self {
        Self {
            id: id.into(),
            service_key: config.service_key,
            url: config.url,
            max_retries: config.max_retries,
            client: reqwest::Client::new(),
        }
    }
}

fn pagerduty_dedup_key(alert: &AlertState) -> String {
    if alert.service.is_empty() {
        format!("node/{}", alert.node)
    } else if alert.tag.is_empty() {
        format!("service/{}", alert.service)
    } else {
        format!("service/{}/{}", alert.service, alert.tag)
    }
}

#[async_trait]
impl AlertSink for PagerdutySink {
    fn id(&self) -> &str {
        &self.id
    }

    async fn emit(&self, datacenter: &str, alert: &AlertState) -> Result<(), SinkError> {
        let (action, severity) = match alert.status {
            HealthStatus::Passing => ("resolve", "info"),
            HealthStatus::Warning => ("trigger", "warning"),
            HealthStatus::Critical => ("trigger", "critical"),
        };
        let source = if alert.node.is_empty() {
            alert.service.clone()
        } else {
            alert.node.clone()
        };
        let payload = serde_json::json!({
            "routing_key": self.service_key,
            "event_action": action,
            "dedup_key": pagerduty_dedup_key(alert),
            "payload": {
                "summary": alert.message,
                "source": source,
                "severity": severity,
                "group": datacenter,
                "custom_details": { "details": alert.details },
            },
        });
        send_with_retries(&self.id, self.max_retries, || {
            self.client.post(&self.url).json(&payload)
        })
        .await
    }
}

async fn send_with_retries<F>(id: &str, max_retries: u32, build: F) -> Result<(), SinkError>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let attempts = max_retries.max(1);
    let mut last_error = SinkError::Network("no delivery attempts made".to_string());
    for attempt in 1..=attempts {
        match build().send().await {
            Ok(response) if response.status().is_success() => return Ok(()),
            Ok(response) => {
                last_error = SinkError::Remote(format!("endpoint returned {}", response.status()));
            }
            Err(e) => last_error = SinkError::Network(e.to_string()),
        }
        if attempt < attempts {
            tracing::warn!(sink = id, attempt, error = %last_error, "Error delivering alert, retrying");
            tokio::time::sleep(RETRY_WAIT).await;
        }
    }
    Err(last_error)
}

/// The named set of sinks configured for this daemon.
#[derive(Clone, Default)]
pub struct SinkRegistry {
    sinks: HashMap<String, Arc<dyn AlertSink>>,
}

impl SinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct every sink declared in the configuration.
    pub fn build(config: &Config) -> Self {
        let mut registry = Self::new();
        for (id, declaration) in &config.handlers {
            let sink: Arc<dyn AlertSink> = match declaration {
                SinkConfig::Stdout(c) => Arc::new(StdoutSink::new(id.clone(), c.clone())),
                SinkConfig::Webhook(c) => Arc::new(WebhookSink::new(id.clone(), c.clone())),
                SinkConfig::Slack(c) => Arc::new(SlackSink::new(id.clone(), c.clone())),
                SinkConfig::Pagerduty(c) => Arc::new(PagerdutySink::new(id.clone(), c.clone())),
            };
            tracing::info!(handler = %id, "Loaded handler");
            registry.insert(sink);
        }
        registry
    }

    /// Register a sink under its own id, replacing any previous one.
    pub fn insert(&mut self, sink: Arc<dyn AlertSink>) {
        self.sinks.insert(sink.id().to_string(), sink);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn AlertSink>> {
        self.sinks.get(id).cloned()
    }

    /// Resolve the sinks that should fire for `service` (or a node subject
    /// when `None`), in configured order. An empty filter means every
    /// declared sink fires.
    pub fn sinks_for(&self, config: &Config, service: Option<&str>) -> Vec<Arc<dyn AlertSink>> {
        let filters = config.handler_ids_for(service);
        if filters.is_empty() {
            let mut ids: Vec<&String> = self.sinks.keys().collect();
            ids.sort();
            return ids.into_iter().filter_map(|id| self.get(id)).collect();
        }
        filters
            .iter()
            .filter_map(|id| match self.get(id) {
                Some(sink) => Some(sink),
                None => {
                    tracing::warn!(handler = %id, "Configured handler is not declared, skipping");
                    None
                }
            })
            .collect()
    }
}
