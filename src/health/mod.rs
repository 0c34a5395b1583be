//! Health primitives and the health-source abstraction.
//!
//! A [`HealthSource`] exposes blocking (long-polling) queries against the
//! cluster's health and catalog endpoints. Each query returns a snapshot
//! plus an opaque monotonic index; passing that index back blocks the next
//! call until something changes or the wait time elapses.

pub mod consul;
pub mod memory;

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// How long a blocking health/catalog query waits for a change.
pub const WATCH_WAIT: Duration = Duration::from_secs(15);

/// How long to back off after a failed health/catalog query.
pub const ERROR_WAIT: Duration = Duration::from_secs(10);

/// Health of a single check, ordered by severity.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Passing,
    Warning,
    Critical,
}

impl HealthStatus {
    /// Parse a status string, returning `None` for anything unrecognized.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "passing" => Some(HealthStatus::Passing),
            "warning" => Some(HealthStatus::Warning),
            "critical" => Some(HealthStatus::Critical),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Passing => "passing",
            HealthStatus::Warning => "warning",
            HealthStatus::Critical => "critical",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single health check observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub node: String,
    pub check_id: String,
    pub name: String,
    pub status: HealthStatus,
    /// Empty for node-level checks.
    #[serde(default)]
    pub service_id: String,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub output: String,
}

impl HealthCheck {
    /// The `node/check_id` key identifying this check within a subject.
    pub fn key(&self) -> String {
        format!("{}/{}", self.node, self.check_id)
    }

    /// Whether this check belongs to a service registration.
    pub fn is_service_check(&self) -> bool {
        !self.service_id.is_empty()
    }
}

/// Reduce a set of check statuses to an overall health by max severity.
///
/// An empty set is `passing`.
pub fn aggregate<'a, I>(statuses: I) -> HealthStatus
where
    I: IntoIterator<Item = &'a HealthStatus>,
{
    statuses
        .into_iter()
        .copied()
        .max()
        .unwrap_or(HealthStatus::Passing)
}

/// Service name to the set of tags seen on its registrations.
pub type ServiceCatalog = HashMap<String, Vec<String>>;

/// Identity of the agent this daemon runs beside.
#[derive(Debug, Clone)]
pub struct AgentInfo {
    pub node_name: String,
    pub datacenter: String,
}

/// Blocking query API for node health, service health, and the catalog.
#[async_trait]
pub trait HealthSource: Send + Sync {
    /// All checks registered on `node`, service checks included.
    async fn node_checks(
        &self,
        node: &str,
        index: u64,
        wait: Duration,
    ) -> Result<(Vec<HealthCheck>, u64), HealthError>;

    /// All checks of `service` across the cluster.
    async fn service_checks(
        &self,
        service: &str,
        index: u64,
        wait: Duration,
    ) -> Result<(Vec<HealthCheck>, u64), HealthError>;

    /// The cluster-wide service catalog.
    async fn list_services(
        &self,
        index: u64,
        wait: Duration,
    ) -> Result<(ServiceCatalog, u64), HealthError>;

    /// Services registered on a single node.
    async fn node_services(
        &self,
        node: &str,
        index: u64,
        wait: Duration,
    ) -> Result<(ServiceCatalog, u64), HealthError>;

    /// Names of all nodes in the cluster.
    async fn list_nodes(&self, index: u64, wait: Duration)
        -> Result<(Vec<String>, u64), HealthError>;

    /// Tags carried by `service` on `node`'s registration, or `None` if the
    /// service is not registered there.
    async fn node_service_tags(
        &self,
        node: &str,
        service: &str,
    ) -> Result<Option<Vec<String>>, HealthError>;

    /// Node name and datacenter of the local agent.
    async fn agent_info(&self) -> Result<AgentInfo, HealthError>;
}

#[derive(Debug, thiserror::Error)]
pub enum HealthError {
    #[error("network error: {0}")]
    Network(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("error decoding response: {0}")]
    Decode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_ordering() {
        assert!(HealthStatus::Passing < HealthStatus::Warning);
        assert!(HealthStatus::Warning < HealthStatus::Critical);
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(HealthStatus::parse("passing"), Some(HealthStatus::Passing));
        assert_eq!(HealthStatus::parse("warning"), Some(HealthStatus::Warning));
        assert_eq!(
            HealthStatus::parse("critical"),
            Some(HealthStatus::Critical)
        );
        assert_eq!(HealthStatus::parse("maintenance"), None);
    }

    #[test]
    fn test_aggregate_empty_is_passing() {
        assert_eq!(aggregate([].iter()), HealthStatus::Passing);
    }

    #[test]
    fn test_aggregate_max_severity() {
        let passing_only = [HealthStatus::Passing, HealthStatus::Passing];
        assert_eq!(aggregate(passing_only.iter()), HealthStatus::Passing);

        let with_warning = [HealthStatus::Passing, HealthStatus::Warning];
        assert_eq!(aggregate(with_warning.iter()), HealthStatus::Warning);

        let with_critical = [
            HealthStatus::Passing,
            HealthStatus::Warning,
            HealthStatus::Critical,
        ];
        assert_eq!(aggregate(with_critical.iter()), HealthStatus::Critical);
    }

    #[test]
    fn test_check_key() {
        let check = HealthCheck {
            node: "node1".to_string(),
            check_id: "mem".to_string(),
            name: "memory usage".to_string(),
            status: HealthStatus::Passing,
            service_id: String::new(),
            service_name: String::new(),
            output: String::new(),
        };
        assert_eq!(check.key(), "node1/mem");
        assert!(!check.is_service_check());
    }
}
