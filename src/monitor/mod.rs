//! Per-subject monitoring: leader election, health watching, and alert
//! proposals.
//!
//! Each monitor races for its subject's leader lock, rehydrates the
//! last-known check states from the KV tree on every acquisition, then
//! loops a blocking health query. New-or-changed checks are persisted
//! before anything else happens; when the persisted picture changes the
//! overall aggregate, an alert proposal is handed to the quiescence gate.

pub mod diff;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::alerts::notifier::AlertSink;
use crate::alerts::AlertGate;
use crate::config::Config;
use crate::health::{
    aggregate, HealthCheck, HealthError, HealthSource, HealthStatus, ERROR_WAIT, WATCH_WAIT,
};
use crate::kv::lock::LockSession;
use crate::kv::KvStore;
use crate::state::{self, AlertState, CheckState, Subject};
use diff::{diff_node_checks, diff_service_checks, CheckUpdate};

/// Pause between leadership polls while another instance holds the lock.
const STANDBY_WAIT: Duration = Duration::from_secs(1);

/// Handle used to stop a running monitor and wait for its teardown,
/// including the release of its leader lock.
pub struct MonitorHandle {
    subject: Subject,
    stop_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    /// Signal shutdown and block until the monitor has released its lock.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(()).await;
        let _ = self.task.await;
    }
}

/// State machine for one monitored subject.
pub struct SubjectMonitor {
    subject: Subject,
    config: Arc<Config>,
    kv: Arc<dyn KvStore>,
    health: Arc<dyn HealthSource>,
    sinks: Vec<Arc<dyn AlertSink>>,
    datacenter: String,
}

impl SubjectMonitor {
    pub fn new(
        subject: Subject,
        config: Arc<Config>,
        kv: Arc<dyn KvStore>,
        health: Arc<dyn HealthSource>,
        sinks: Vec<Arc<dyn AlertSink>>,
        datacenter: impl Into<String>,
    ) -> Self {
        Self {
            subject,
            config,
            kv,
            health,
            sinks,
            datacenter: datacenter.into(),
        }
    }

    /// Spawn the monitor task.
    pub fn spawn(self) -> MonitorHandle {
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let subject = self.subject.clone();
        let task = tokio::spawn(self.run(stop_rx));
        MonitorHandle {
            subject,
            stop_tx,
            task,
        }
    }

    async fn run(self, mut stop_rx: mpsc::Receiver<()>) {
        let root = self.config.kv_root.clone();
        let last_known: Arc<Mutex<HashMap<String, HealthStatus>>> =
            Arc::new(Mutex::new(HashMap::new()));
        // The aggregate as of the last proposal within this tenure.
        let last_status = Arc::new(Mutex::new(HealthStatus::Passing));

        let gate = AlertGate::new(
            Arc::clone(&self.kv),
            self.subject.alert_key(&root),
            self.config.change_threshold_for(self.subject.service_name()),
            self.sinks.clone(),
            self.datacenter.clone(),
        );

        let mut lock = LockSession::new(
            Arc::clone(&self.kv),
            self.subject.leader_key(&root),
            self.subject.to_string(),
        );
        {
            let kv = Arc::clone(&self.kv);
            let prefix = self.subject.check_prefix(&root);
            let last_known = Arc::clone(&last_known);
            let last_status = Arc::clone(&last_status);
            lock.start(Arc::new(move || {
                let kv = Arc::clone(&kv);
                let prefix = prefix.clone();
                let last_known = Arc::clone(&last_known);
                let last_status = Arc::clone(&last_status);
                Box::pin(async move {
                    match state::load_check_states(kv.as_ref(), &prefix).await {
                        Ok(states) => {
                            let status = aggregate(states.values());
                            *last_known.lock() = states;
                            *last_status.lock() = status;
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Error loading previous check states");
                        }
                    }
                })
            }));
        }

        tracing::debug!(subject = %self.subject, "Initialized monitor");

        let mut wait_index = 0u64;
        loop {
            if !lock.acquired() {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = tokio::time::sleep(STANDBY_WAIT) => {}
                }
                continue;
            }

            let result = tokio::select! {
                _ = stop_rx.recv() => break,
                result = self.query_checks(wait_index) => result,
            };
            let (checks, next_index) = match result {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    tracing::error!(
                        subject = %self.subject,
                        error = %e,
                        "Error watching health, retrying in 10s"
                    );
                    tokio::select! {
                        _ = stop_rx.recv() => break,
                        _ = tokio::time::sleep(ERROR_WAIT) => {}
                    }
                    continue;
                }
            };
            wait_index = next_index;

            // Leadership may have lapsed while the query was parked; only
            // the current leader may write this subject's sub-tree.
            if !lock.acquired() {
                continue;
            }

            let updates = {
                let known = last_known.lock().clone();
                match &self.subject {
                    Subject::Node { .. } => diff_node_checks(&checks, &known),
                    Subject::Service { service } => {
                        diff_service_checks(service, None, &checks, &known, self.health.as_ref())
                            .await
                    }
                    Subject::ServiceTag { service, tag } => {
                        diff_service_checks(
                            service,
                            Some(tag),
                            &checks,
                            &known,
                            self.health.as_ref(),
                        )
                        .await
                    }
                }
            };
            if updates.is_empty() {
                continue;
            }

            if !self.persist_updates(&root, &updates).await {
                // Leave last_known untouched; the next cycle retries the
                // whole batch.
                continue;
            }

            let new_status = {
                let mut known = last_known.lock();
                for (id, update) in &updates {
                    known.insert(id.clone(), update.check.status);
                }
                aggregate(known.values())
            };

            let changed = {
                let mut status = last_status.lock();
                let changed = *status != new_status;
                *status = new_status;
                changed
            };
            if !changed {
                continue;
            }

            let proposed = self.build_alert(new_status, &checks);
            let gate = gate.clone();
            tokio::spawn(async move { gate.try_alert(proposed).await });
        }

        tracing::info!(subject = %self.subject, "Shutting down monitor");
        lock.stop().await;
    }

    async fn query_checks(&self, wait_index: u64) -> Result<(Vec<HealthCheck>, u64), HealthError> {
        match &self.subject {
            Subject::Node { node } => self.health.node_checks(node, wait_index, WATCH_WAIT).await,
            Subject::Service { service } | Subject::ServiceTag { service, .. } => {
                self.health
                    .service_checks(service, wait_index, WATCH_WAIT)
                    .await
            }
        }
    }

    /// Write every update's state blob. On any failure the cycle is
    /// abandoned so the next snapshot retries the whole batch.
    async fn persist_updates(&self, root: &str, updates: &HashMap<String, CheckUpdate>) -> bool {
        for update in updates.values() {
            let check = &update.check;
            log_check_update(update);
            let key = self.subject.check_key(root, &check.node, &check.check_id);
            let value = CheckState {
                status: check.status,
            };
            if let Err(e) = state::store_state(self.kv.as_ref(), &key, &value).await {
                tracing::error!(
                    subject = %self.subject,
                    key = %key,
                    error = %e,
                    "Error storing check state"
                );
                return false;
            }
        }
        true
    }

    fn build_alert(&self, status: HealthStatus, checks: &[HealthCheck]) -> AlertState {
        AlertState {
            status,
            node: self.subject.node_name().unwrap_or_default().to_string(),
            service: self.subject.service_name().unwrap_or_default().to_string(),
            tag: self.subject.tag().unwrap_or_default().to_string(),
            message: alert_message(&self.subject, status),
            details: render_details(&self.subject, checks),
            ..AlertState::default()
        }
    }
}

fn log_check_update(update: &CheckUpdate) {
    let check = &update.check;
    if check.is_service_check() {
        let tag_info = update
            .tag
            .as_deref()
            .map(|t| format!(" (tag: {})", t))
            .unwrap_or_default();
        tracing::debug!(
            "Check '{}' in service '{}'{} on node {} is {}",
            check.check_id,
            check.service_name,
            tag_info,
            check.node,
            check.status
        );
    } else {
        tracing::debug!(
            "Check '{}' on node {} is {}",
            check.check_id,
            check.node,
            check.status
        );
    }
}

fn alert_message(subject: &Subject, status: HealthStatus) -> String {
    match subject {
        Subject::Node { node } => format!("Node '{}' is now {}", node, status),
        Subject::Service { service } => format!("Service '{}' is now {}", service, status),
        Subject::ServiceTag { service, tag } => {
            format!("Service '{}' (tag: {}) is now {}", service, tag, status)
        }
    }
}

fn format_check_line(check: &HealthCheck) -> String {
    let output = check.output.trim();
    if output.is_empty() {
        format!("Check '{}' is {}", check.check_id, check.status)
    } else {
        format!("Check '{}' is {}: {}", check.check_id, check.status, output)
    }
}

/// Human-readable snapshot of the failing checks: a flat list of the
/// node's own checks for node subjects, grouped by node for services.
fn render_details(subject: &Subject, checks: &[HealthCheck]) -> String {
    match subject {
        Subject::Node { .. } => checks
            .iter()
            .filter(|c| !c.is_service_check() && c.status != HealthStatus::Passing)
            .map(format_check_line)
            .collect::<Vec<_>>()
            .join("\n"),
        Subject::Service { .. } | Subject::ServiceTag { .. } => {
            let mut by_node: BTreeMap<&str, Vec<&HealthCheck>> = BTreeMap::new();
            for check in checks {
                if check.status == HealthStatus::Passing {
                    continue;
                }
                by_node.entry(check.node.as_str()).or_default().push(check);
            }
            let mut lines = Vec::new();
            for (node, failing) in by_node {
                lines.push(format!("On node '{}':", node));
                for check in failing {
                    lines.push(format!("  {}", format_check_line(check)));
                }
            }
            lines.join("\n")
        }
    }
}
