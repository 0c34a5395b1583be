//! Discovery of monitorable subjects and monitor lifecycle management.
//!
//! Two independent workers watch the catalog with blocking queries:
//! service discovery tracks services (or each of their tags when
//! `distinct_tags` is set) and node discovery tracks cluster membership in
//! global mode. Each worker spawns a [`SubjectMonitor`] per new subject
//! and retires monitors whose subject left the catalog. On shutdown a
//! worker stops every monitor it spawned and only returns once their
//! leader locks are released.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::mpsc;

use crate::alerts::SinkRegistry;
use crate::config::{Config, WatchMode};
use crate::health::{HealthSource, ServiceCatalog, ERROR_WAIT, WATCH_WAIT};
use crate::kv::KvStore;
use crate::monitor::{MonitorHandle, SubjectMonitor};
use crate::state::Subject;

/// Everything a worker needs to spawn monitors.
pub(crate) struct DiscoveryContext {
    pub config: Arc<Config>,
    pub kv: Arc<dyn KvStore>,
    pub health: Arc<dyn HealthSource>,
    pub sinks: SinkRegistry,
    pub node_name: String,
    pub datacenter: String,
}

impl DiscoveryContext {
    pub(crate) fn spawn_monitor(&self, subject: Subject) -> MonitorHandle {
        let sinks = self.sinks.sinks_for(&self.config, subject.service_name());
        SubjectMonitor::new(
            subject,
            Arc::clone(&self.config),
            Arc::clone(&self.kv),
            Arc::clone(&self.health),
            sinks,
            self.datacenter.clone(),
        )
        .spawn()
    }
}

/// The subjects a service catalog snapshot should be monitored as.
fn service_subjects(config: &Config, catalog: &ServiceCatalog) -> HashSet<Subject> {
    let mut subjects = HashSet::new();
    for (service, tags) in catalog {
        let service_config = config.service_config(service);
        if service_config.map(|c| c.distinct_tags).unwrap_or(false) {
            let ignored = service_config.map(|c| c.ignored_tags.as_slice()).unwrap_or(&[]);
            for tag in tags {
                if !ignored.contains(tag) {
                    subjects.insert(Subject::service_tag(service.clone(), tag.clone()));
                }
            }
        } else {
            subjects.insert(Subject::service(service.clone()));
        }
    }
    subjects
}

/// Reconcile the tracked monitors against the desired subject set.
fn reconcile(
    ctx: &DiscoveryContext,
    monitors: &mut HashMap<Subject, MonitorHandle>,
    desired: HashSet<Subject>,
    kind: &str,
) {
    for subject in &desired {
        if !monitors.contains_key(subject) {
            tracing::info!(subject = %subject, "Discovered new {}", kind);
            monitors.insert(subject.clone(), ctx.spawn_monitor(subject.clone()));
        }
    }

    let gone: Vec<Subject> = monitors
        .keys()
        .filter(|subject| !desired.contains(subject))
        .cloned()
        .collect();
    for subject in gone {
        tracing::info!(subject = %subject, "{} left, removing monitor", kind);
        if let Some(handle) = monitors.remove(&subject) {
            tokio::spawn(handle.stop());
        }
    }
}

async fn stop_all(monitors: HashMap<Subject, MonitorHandle>, kind: &str) {
    tracing::info!(count = monitors.len(), "Shutting down {} monitors", kind);
    join_all(monitors.into_values().map(MonitorHandle::stop)).await;
    tracing::info!("Finished shutting down {} monitors", kind);
}

/// Watch the service catalog, spawning and retiring service monitors.
pub(crate) async fn discover_services(
    ctx: Arc<DiscoveryContext>,
    mut shutdown: mpsc::Receiver<()>,
) {
    if ctx.config.service_watch == WatchMode::Global {
        tracing::info!("Discovering services from catalog");
    } else {
        tracing::info!(node = %ctx.node_name, "Discovering services on local node");
    }

    let mut monitors: HashMap<Subject, MonitorHandle> = HashMap::new();
    let mut wait_index = 0u64;
    loop {
        let query = async {
            if ctx.config.service_watch == WatchMode::Global {
                ctx.health.list_services(wait_index, WATCH_WAIT).await
            } else {
                ctx.health
                    .node_services(&ctx.node_name, wait_index, WATCH_WAIT)
                    .await
            }
        };
        let result = tokio::select! {
            _ = shutdown.recv() => break,
            result = query => result,
        };
        let (catalog, next_index) = match result {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!(error = %e, "Error trying to watch services, retrying in 10s");
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = tokio::time::sleep(ERROR_WAIT) => {}
                }
                continue;
            }
        };
        wait_index = next_index;

        let desired = service_subjects(&ctx.config, &catalog);
        reconcile(&ctx, &mut monitors, desired, "service");
    }

    stop_all(monitors, "service").await;
}

/// Watch cluster membership, spawning and retiring node monitors.
/// Only used in global node-watch mode; local mode pins a single monitor
/// to the local node at startup.
pub(crate) async fn discover_nodes(ctx: Arc<DiscoveryContext>, mut shutdown: mpsc::Receiver<()>) {
    let mut monitors: HashMap<Subject, MonitorHandle> = HashMap::new();
    let mut wait_index = 0u64;
    loop {
        let result = tokio::select! {
            _ = shutdown.recv() => break,
            result = ctx.health.list_nodes(wait_index, WATCH_WAIT) => result,
        };
        let (nodes, next_index) = match result {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!(error = %e, "Error querying node list, retrying in 10s");
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = tokio::time::sleep(ERROR_WAIT) => {}
                }
                continue;
            }
        };
        wait_index = next_index;

        let desired: HashSet<Subject> = nodes.into_iter().map(Subject::node).collect();
        reconcile(&ctx, &mut monitors, desired, "node");
    }

    stop_all(monitors, "node").await;
}
