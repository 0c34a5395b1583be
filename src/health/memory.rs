//! In-memory [`HealthSource`] simulating a small cluster, for tests and
//! embedded setups.
//!
//! Mutators bump a monotonic index and wake blocked watchers, so blocking
//! queries behave like the real agent's: a call with a stale index returns
//! immediately, a call with the current index parks until something
//! changes or the wait elapses.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{AgentInfo, HealthCheck, HealthError, HealthSource, HealthStatus, ServiceCatalog};

#[derive(Clone)]
pub struct MemoryHealth {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<ClusterState>,
    changed: Notify,
    node_name: String,
    datacenter: String,
}

#[derive(Default)]
struct ClusterState {
    index: u64,
    nodes: Vec<String>,
    /// (node, service) -> tags.
    registrations: BTreeMap<(String, String), Vec<String>>,
    /// (node, check_id) -> check.
    checks: BTreeMap<(String, String), HealthCheck>,
}

impl MemoryHealth {
    pub fn new(node_name: impl Into<String>, datacenter: impl Into<String>) -> Self {
        let node_name = node_name.into();
        let health = Self {
            inner: Arc::new(Inner {
                state: Mutex::new(ClusterState {
                    index: 1,
                    ..ClusterState::default()
                }),
                changed: Notify::new(),
                node_name: node_name.clone(),
                datacenter: datacenter.into(),
            }),
        };
        health.add_node(&node_name);
        health
    }

    pub fn node_name(&self) -> &str {
        &self.inner.node_name
    }

    fn mutate(&self, f: impl FnOnce(&mut ClusterState)) {
        let mut state = self.inner.state.lock();
        f(&mut state);
        state.index += 1;
        drop(state);
        self.inner.changed.notify_waiters();
    }

    pub fn add_node(&self, name: &str) {
        self.mutate(|state| {
            if !state.nodes.iter().any(|n| n == name) {
                state.nodes.push(name.to_string());
            }
        });
    }

    pub fn remove_node(&self, name: &str) {
        self.mutate(|state| {
            state.nodes.retain(|n| n != name);
            state.registrations.retain(|(node, _), _| node != name);
            state.checks.retain(|(node, _), _| node != name);
        });
    }

    /// Register (or update) `service` on `node` with the given tags and a
    /// service check in the given status.
    pub fn register_service(&self, node: &str, service: &str, tags: &[&str], status: HealthStatus) {
        self.mutate(|state| {
            if !state.nodes.iter().any(|n| n == node) {
                state.nodes.push(node.to_string());
            }
            state.registrations.insert(
                (node.to_string(), service.to_string()),
                tags.iter().map(|t| t.to_string()).collect(),
            );
            let check_id = format!("service:{}", service);
            state.checks.insert(
                (node.to_string(), check_id.clone()),
                HealthCheck {
                    node: node.to_string(),
                    check_id,
                    name: format!("Service '{}' check", service),
                    status,
                    service_id: service.to_string(),
                    service_name: service.to_string(),
                    output: format!("example {} check output", status),
                },
            );
        });
    }

    pub fn deregister_service(&self, node: &str, service: &str) {
        self.mutate(|state| {
            state
                .registrations
                .remove(&(node.to_string(), service.to_string()));
            let check_id = format!("service:{}", service);
            state.checks.remove(&(node.to_string(), check_id));
        });
    }

    /// Set (or create) a node-level check.
    pub fn set_check(&self, node: &str, check_id: &str, status: HealthStatus, output: &str) {
        self.mutate(|state| {
            if !state.nodes.iter().any(|n| n == node) {
                state.nodes.push(node.to_string());
            }
            state.checks.insert(
                (node.to_string(), check_id.to_string()),
                HealthCheck {
                    node: node.to_string(),
                    check_id: check_id.to_string(),
                    name: check_id.to_string(),
                    status,
                    service_id: String::new(),
                    service_name: String::new(),
                    output: output.to_string(),
                },
            );
        });
    }

    /// Park until the state index moves past `index` or `wait` elapses.
    /// An index of zero returns immediately, like a first read.
    async fn wait_past(&self, index: u64, wait: Duration) {
        if index == 0 {
            return;
        }
        let deadline = tokio::time::sleep(wait);
        tokio::pin!(deadline);
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.state.lock().index > index {
                return;
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = &mut deadline => return,
            }
        }
    }
}

#[async_trait]
impl HealthSource for MemoryHealth {
    async fn node_checks(
        &self,
        node: &str,
        index: u64,
        wait: Duration,
    ) -> Result<(Vec<HealthCheck>, u64), HealthError> {
        self.wait_past(index, wait).await;
        let state = self.inner.state.lock();
        let checks = state
            .checks
            .values()
            .filter(|c| c.node == node)
            .cloned()
            .collect();
        Ok((checks, state.index))
    }

    async fn service_checks(
        &self,
        service: &str,
        index: u64,
        wait: Duration,
    ) -> Result<(Vec<HealthCheck>, u64), HealthError> {
        self.wait_past(index, wait).await;
        let state = self.inner.state.lock();
        let checks = state
            .checks
            .values()
            .filter(|c| c.service_name == service)
            .cloned()
            .collect();
        Ok((checks, state.index))
    }

    async fn list_services(
        &self,
        index: u64,
        wait: Duration,
    ) -> Result<(ServiceCatalog, u64), HealthError> {
        self.wait_past(index, wait).await;
        let state = self.inner.state.lock();
        let mut services = ServiceCatalog::new();
        for ((_, service), tags) in &state.registrations {
            let entry: &mut Vec<String> = services.entry(service.clone()).or_default();
            for tag in tags {
                if !entry.contains(tag) {
                    entry.push(tag.clone());
                }
            }
        }
        Ok((services, state.index))
    }

    async fn node_services(
        &self,
        node: &str,
        index: u64,
        wait: Duration,
    ) -> Result<(ServiceCatalog, u64), HealthError> {
        self.wait_past(index, wait).await;
        let state = self.inner.state.lock();
        let mut services = ServiceCatalog::new();
        for ((reg_node, service), tags) in &state.registrations {
            if reg_node == node {
                services.insert(service.clone(), tags.clone());
            }
        }
        Ok((services, state.index))
    }

    async fn list_nodes(
        &self,
        index: u64,
        wait: Duration,
    ) -> Result<(Vec<String>, u64), HealthError> {
        self.wait_past(index, wait).await;
        let state = self.inner.state.lock();
        Ok((state.nodes.clone(), state.index))
    }

    async fn node_service_tags(
        &self,
        node: &str,
        service: &str,
    ) -> Result<Option<Vec<String>>, HealthError> {
        let state = self.inner.state.lock();
        Ok(state
            .registrations
            .get(&(node.to_string(), service.to_string()))
            .cloned())
    }

    async fn agent_info(&self) -> Result<AgentInfo, HealthError> {
        Ok(AgentInfo {
            node_name: self.inner.node_name.clone(),
            datacenter: self.inner.datacenter.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stale_index_returns_immediately() {
        let health = MemoryHealth::new("node1", "dc1");
        health.set_check("node1", "mem", HealthStatus::Passing, "");

        let (checks, index) = health.node_checks("node1", 0, Duration::from_secs(5)).await.unwrap();
        assert_eq!(checks.len(), 1);
        assert!(index > 0);
    }

    #[tokio::test]
    async fn test_blocking_query_wakes_on_change() {
        let health = MemoryHealth::new("node1", "dc1");
        let (_, index) = health.node_checks("node1", 0, Duration::from_secs(5)).await.unwrap();

        let watcher = health.clone();
        let watch =
            tokio::spawn(
                async move { watcher.node_checks("node1", index, Duration::from_secs(5)).await },
            );

        tokio::time::sleep(Duration::from_millis(20)).await;
        health.set_check("node1", "mem", HealthStatus::Critical, "oom");

        let (checks, next) = tokio::time::timeout(Duration::from_secs(1), watch)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0].status, HealthStatus::Critical);
        assert!(next > index);
    }

    #[tokio::test]
    async fn test_blocking_query_times_out_unchanged() {
        let health = MemoryHealth::new("node1", "dc1");
        let (_, index) = health.list_nodes(0, Duration::from_secs(5)).await.unwrap();

        let start = tokio::time::Instant::now();
        let (nodes, next) = health
            .list_nodes(index, Duration::from_millis(100))
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(nodes, vec!["node1".to_string()]);
        assert_eq!(next, index);
    }

    #[tokio::test]
    async fn test_service_catalog_merges_tags() {
        let health = MemoryHealth::new("node1", "dc1");
        health.register_service("node1", "redis", &["alpha", "beta"], HealthStatus::Passing);
        health.register_service("node2", "redis", &["alpha"], HealthStatus::Passing);

        let (services, _) = health.list_services(0, Duration::from_secs(1)).await.unwrap();
        let tags = services.get("redis").unwrap();
        assert!(tags.contains(&"alpha".to_string()));
        assert!(tags.contains(&"beta".to_string()));
        assert_eq!(tags.len(), 2);

        let tags = health
            .node_service_tags("node2", "redis")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tags, vec!["alpha".to_string()]);
        assert!(health
            .node_service_tags("node3", "redis")
            .await
            .unwrap()
            .is_none());
    }
}
