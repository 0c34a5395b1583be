//! Shared helpers for the crate's tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::alerts::notifier::{AlertSink, SinkError};
use crate::health::HealthStatus;
use crate::state::AlertState;

/// Sink that forwards every alert to a channel for assertions.
pub(crate) struct ChannelSink {
    id: String,
    tx: mpsc::UnboundedSender<AlertState>,
}

#[async_trait]
impl AlertSink for ChannelSink {
    fn id(&self) -> &str {
        &self.id
    }

    async fn emit(&self, _datacenter: &str, alert: &AlertState) -> Result<(), SinkError> {
        self.tx
            .send(alert.clone())
            .map_err(|e| SinkError::Remote(e.to_string()))
    }
}

pub(crate) fn channel_sink(
    id: &str,
) -> (Arc<dyn AlertSink>, mpsc::UnboundedReceiver<AlertState>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Arc::new(ChannelSink {
            id: id.to_string(),
            tx,
        }),
        rx,
    )
}

/// Sink whose deliveries always fail.
pub(crate) struct FailingSink {
    id: String,
}

#[async_trait]
impl AlertSink for FailingSink {
    fn id(&self) -> &str {
        &self.id
    }

    async fn emit(&self, _datacenter: &str, _alert: &AlertState) -> Result<(), SinkError> {
        Err(SinkError::Remote("delivery refused".to_string()))
    }
}

pub(crate) fn failing_sink(id: &str) -> Arc<dyn AlertSink> {
    Arc::new(FailingSink { id: id.to_string() })
}

/// Wait up to five seconds for an alert with the given status.
pub(crate) async fn expect_alert(
    alerts: &mut mpsc::UnboundedReceiver<AlertState>,
    status: HealthStatus,
) -> AlertState {
    let alert = tokio::time::timeout(Duration::from_secs(5), alerts.recv())
        .await
        .expect("didn't get alert within the timeout")
        .expect("alert channel closed");
    assert_eq!(alert.status, status, "alert: {:?}", alert);
    alert
}

/// Assert that nothing is emitted for a little while.
pub(crate) async fn expect_no_alert(alerts: &mut mpsc::UnboundedReceiver<AlertState>) {
    if let Ok(Some(alert)) =
        tokio::time::timeout(Duration::from_millis(300), alerts.recv()).await
    {
        panic!("received an alert when we should have received nothing: {:?}", alert);
    }
}
