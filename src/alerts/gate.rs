//! Quiescence gate: generation-checked, deduplicated alert emission.
//!
//! Every proposed alert is written to the subject's `alert` key with a
//! bumped `update_index`, then sleeps out the change threshold. On wake it
//! re-reads the state: if the index moved, a newer proposal superseded this
//! one and it exits quietly. Otherwise the sinks fire, but only when the
//! proposed status actually differs from the durable `last_alerted`, which
//! is what deduplicates across restarts and leader handoffs.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::alerts::notifier::AlertSink;
use crate::kv::KvStore;
use crate::state::{load_state, store_state, AlertState};

/// One subject's gate. Cheap to clone into the per-proposal tasks.
#[derive(Clone)]
pub struct AlertGate {
    kv: Arc<dyn KvStore>,
    alert_key: String,
    threshold: Duration,
    sinks: Vec<Arc<dyn AlertSink>>,
    datacenter: String,
    /// Serializes this subject's read-modify-write cycles within one
    /// leader; the leader lock covers cross-leader writes.
    lock: Arc<Mutex<()>>,
}

impl AlertGate {
    pub fn new(
        kv: Arc<dyn KvStore>,
        alert_key: String,
        threshold: Duration,
        sinks: Vec<Arc<dyn AlertSink>>,
        datacenter: String,
    ) -> Self {
        Self {
            kv,
            alert_key,
            threshold,
            sinks,
            datacenter,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Record `proposed` and, after the quiescence window, emit it to the
    /// sinks iff nothing superseded it in the meantime.
    pub async fn try_alert(&self, proposed: AlertState) {
        let my_index = {
            let _guard = self.lock.lock().await;
            let mut current = match load_state::<AlertState>(self.kv.as_ref(), &self.alert_key)
                .await
            {
                Ok(Some(current)) => current,
                Ok(None) => AlertState {
                    node: proposed.node.clone(),
                    service: proposed.service.clone(),
                    tag: proposed.tag.clone(),
                    ..AlertState::default()
                },
                Err(e) => {
                    tracing::error!(key = %self.alert_key, error = %e, "Error fetching alert state");
                    return;
                }
            };
            current.status = proposed.status;
            current.message = proposed.message.clone();
            current.details = proposed.details.clone();
            current.update_index += 1;
            if let Err(e) = store_state(self.kv.as_ref(), &self.alert_key, &current).await {
                tracing::error!(key = %self.alert_key, error = %e, "Error storing alert state");
                return;
            }
            current.update_index
        };

        tokio::time::sleep(self.threshold).await;

        let _guard = self.lock.lock().await;
        let mut current = match load_state::<AlertState>(self.kv.as_ref(), &self.alert_key).await {
            Ok(Some(current)) => current,
            Ok(None) => {
                tracing::warn!(key = %self.alert_key, "Alert state missing after quiescence window");
                return;
            }
            Err(e) => {
                tracing::error!(key = %self.alert_key, error = %e, "Error fetching alert state");
                return;
            }
        };
        if current.update_index != my_index {
            tracing::debug!(
                key = %self.alert_key,
                "Alert superseded during quiescence window"
            );
            return;
        }
        if proposed.status == current.last_alerted {
            return;
        }
        for sink in &self.sinks {
            if let Err(e) = sink.emit(&self.datacenter, &current).await {
                // last_alerted stays put so the next real status change
                // retries delivery.
                tracing::error!(sink = sink.id(), error = %e, "Error emitting alert");
                return;
            }
        }
        current.last_alerted = proposed.status;
        if let Err(e) = store_state(self.kv.as_ref(), &self.alert_key, &current).await {
            tracing::error!(key = %self.alert_key, error = %e, "Error storing alert state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthStatus;
    use crate::kv::memory::MemoryKv;
    use crate::testing::{expect_alert, expect_no_alert, channel_sink, failing_sink};

    const ALERT_KEY: &str = "test/alert";

    fn proposal(status: HealthStatus) -> AlertState {
        AlertState {
            status,
            service: "redis".to_string(),
            message: format!("Service 'redis' is now {}", status),
            ..AlertState::default()
        }
    }

    fn gate(kv: &MemoryKv, threshold: Duration, sinks: Vec<Arc<dyn AlertSink>>) -> AlertGate {
        AlertGate::new(
            Arc::new(kv.clone()),
            ALERT_KEY.to_string(),
            threshold,
            sinks,
            "dc1".to_string(),
        )
    }

    #[tokio::test]
    async fn test_emits_after_quiet_window() {
        let kv = MemoryKv::new();
        let (sink, mut alerts) = channel_sink("test");
        let gate = gate(&kv, Duration::from_millis(50), vec![sink]);

        gate.try_alert(proposal(HealthStatus::Critical)).await;

        let alert = expect_alert(&mut alerts, HealthStatus::Critical).await;
        assert_eq!(alert.service, "redis");

        // The durable state records the emission.
        let stored: AlertState = load_state(&kv, ALERT_KEY).await.unwrap().unwrap();
        assert_eq!(stored.last_alerted, HealthStatus::Critical);
        assert_eq!(stored.update_index, 1);
    }

    #[tokio::test]
    async fn test_superseded_proposal_does_not_emit() {
        let kv = MemoryKv::new();
        let (sink, mut alerts) = channel_sink("test");
        let gate = gate(&kv, Duration::from_millis(100), vec![sink]);

        // A flap: critical proposed, then passing before the window closes.
        let first = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.try_alert(proposal(HealthStatus::Critical)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.try_alert(proposal(HealthStatus::Passing)).await })
        };

        first.await.unwrap();
        second.await.unwrap();

        // The critical proposal lost its generation race; the passing one
        // matched last_alerted. Nothing fires.
        expect_no_alert(&mut alerts).await;
    }

    #[tokio::test]
    async fn test_dedupes_when_status_already_alerted() {
        let kv = MemoryKv::new();
        store_state(
            &kv,
            ALERT_KEY,
            &AlertState {
                last_alerted: HealthStatus::Critical,
                ..AlertState::default()
            },
        )
        .await
        .unwrap();

        let (sink, mut alerts) = channel_sink("test");
        let gate = gate(&kv, Duration::from_millis(10), vec![sink]);
        gate.try_alert(proposal(HealthStatus::Critical)).await;

        expect_no_alert(&mut alerts).await;
    }

    #[tokio::test]
    async fn test_sink_failure_keeps_last_alerted() {
        let kv = MemoryKv::new();
        let gate = gate(&kv, Duration::from_millis(10), vec![failing_sink("bad")]);

        gate.try_alert(proposal(HealthStatus::Critical)).await;

        let stored: AlertState = load_state(&kv, ALERT_KEY).await.unwrap().unwrap();
        // Not advanced, so the next real change will retry delivery.
        assert_eq!(stored.last_alerted, HealthStatus::Passing);
    }

    #[tokio::test]
    async fn test_update_index_is_preserved_across_attempts() {
        let kv = MemoryKv::new();
        let (sink, mut alerts) = channel_sink("test");
        let gate = gate(&kv, Duration::from_millis(10), vec![sink]);

        gate.try_alert(proposal(HealthStatus::Critical)).await;
        expect_alert(&mut alerts, HealthStatus::Critical).await;
        gate.try_alert(proposal(HealthStatus::Passing)).await;
        expect_alert(&mut alerts, HealthStatus::Passing).await;

        let stored: AlertState = load_state(&kv, ALERT_KEY).await.unwrap().unwrap();
        assert_eq!(stored.update_index, 2);
    }
}
