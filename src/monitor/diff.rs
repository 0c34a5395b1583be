//! Diffing incoming health snapshots against last-known check state.

use std::collections::HashMap;

use crate::health::{HealthCheck, HealthSource, HealthStatus};

/// A check whose state must be persisted this cycle.
#[derive(Debug, Clone)]
pub struct CheckUpdate {
    /// The subject's tag for tag-scoped service monitors.
    pub tag: Option<String>,
    pub check: HealthCheck,
}

/// Diff a node's checks: service checks are ignored, and a check enters the
/// update map when it is new or its status changed.
pub fn diff_node_checks(
    checks: &[HealthCheck],
    last_known: &HashMap<String, HealthStatus>,
) -> HashMap<String, CheckUpdate> {
    let mut updates = HashMap::new();
    for check in checks {
        if check.is_service_check() {
            continue;
        }
        if last_known.get(&check.key()) != Some(&check.status) {
            updates.insert(
                check.key(),
                CheckUpdate {
                    tag: None,
                    check: check.clone(),
                },
            );
        }
    }
    updates
}

/// Diff a service's checks. Without a tag every new-or-changed check is
/// included. With a tag, a *changed* check only counts if the tag is on the
/// check's node registration; *new* checks are recorded unconditionally so
/// that later changes have something to compare against.
pub async fn diff_service_checks(
    service: &str,
    tag: Option<&str>,
    checks: &[HealthCheck],
    last_known: &HashMap<String, HealthStatus>,
    health: &dyn HealthSource,
) -> HashMap<String, CheckUpdate> {
    let mut updates = HashMap::new();
    for check in checks {
        let key = check.key();
        match last_known.get(&key) {
            Some(old) if *old == check.status => continue,
            Some(_) => {
                if let Some(tag) = tag {
                    match health.node_service_tags(&check.node, service).await {
                        Ok(Some(tags)) if tags.iter().any(|t| t == tag) => {}
                        Ok(_) => continue,
                        Err(e) => {
                            tracing::error!(
                                node = %check.node,
                                service,
                                error = %e,
                                "Error fetching service info for node"
                            );
                            continue;
                        }
                    }
                }
            }
            None => {}
        }
        updates.insert(
            key,
            CheckUpdate {
                tag: tag.map(str::to_string),
                check: check.clone(),
            },
        );
    }
    updates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::memory::MemoryHealth;

    fn check(node: &str, id: &str, status: HealthStatus, service: &str) -> HealthCheck {
        HealthCheck {
            node: node.to_string(),
            check_id: id.to_string(),
            name: id.to_string(),
            status,
            service_id: service.to_string(),
            service_name: service.to_string(),
            output: String::new(),
        }
    }

    #[test]
    fn test_node_diff_ignores_service_checks() {
        let checks = vec![
            check("node1", "mem", HealthStatus::Critical, ""),
            check("node1", "service:redis", HealthStatus::Critical, "redis"),
        ];
        let updates = diff_node_checks(&checks, &HashMap::new());
        assert_eq!(updates.len(), 1);
        assert!(updates.contains_key("node1/mem"));
    }

    #[test]
    fn test_node_diff_new_or_changed() {
        let checks = vec![
            check("node1", "mem", HealthStatus::Passing, ""),
            check("node1", "disk", HealthStatus::Critical, ""),
        ];
        let mut last_known = HashMap::new();
        last_known.insert("node1/mem".to_string(), HealthStatus::Passing);
        last_known.insert("node1/disk".to_string(), HealthStatus::Passing);

        let updates = diff_node_checks(&checks, &last_known);
        // mem is unchanged, disk changed.
        assert_eq!(updates.len(), 1);
        assert_eq!(
            updates.get("node1/disk").unwrap().check.status,
            HealthStatus::Critical
        );

        // A check absent from the map is always included.
        let updates = diff_node_checks(&checks, &HashMap::new());
        assert_eq!(updates.len(), 2);
    }

    #[tokio::test]
    async fn test_service_diff_untagged() {
        let health = MemoryHealth::new("node1", "dc1");
        let checks = vec![
            check("node1", "service:redis", HealthStatus::Critical, "redis"),
            check("node2", "service:redis", HealthStatus::Passing, "redis"),
        ];
        let mut last_known = HashMap::new();
        last_known.insert("node1/service:redis".to_string(), HealthStatus::Passing);
        last_known.insert("node2/service:redis".to_string(), HealthStatus::Passing);

        let updates =
            diff_service_checks("redis", None, &checks, &last_known, &health).await;
        assert_eq!(updates.len(), 1);
        assert!(updates.contains_key("node1/service:redis"));
    }

    #[tokio::test]
    async fn test_service_diff_tag_filters_changed_checks() {
        let health = MemoryHealth::new("node1", "dc1");
        health.register_service("node1", "redis", &["alpha", "beta"], HealthStatus::Passing);
        health.register_service("node2", "redis", &["alpha"], HealthStatus::Passing);

        let checks = vec![
            check("node1", "service:redis", HealthStatus::Critical, "redis"),
            check("node2", "service:redis", HealthStatus::Critical, "redis"),
        ];
        let mut last_known = HashMap::new();
        last_known.insert("node1/service:redis".to_string(), HealthStatus::Passing);
        last_known.insert("node2/service:redis".to_string(), HealthStatus::Passing);

        // Only node1 carries the beta tag, so node2's change is dropped.
        let updates =
            diff_service_checks("redis", Some("beta"), &checks, &last_known, &health).await;
        assert_eq!(updates.len(), 1);
        let update = updates.get("node1/service:redis").unwrap();
        assert_eq!(update.tag.as_deref(), Some("beta"));
    }

    #[tokio::test]
    async fn test_service_diff_tag_records_new_checks_unconditionally() {
        let health = MemoryHealth::new("node1", "dc1");
        health.register_service("node2", "redis", &["alpha"], HealthStatus::Passing);

        let checks = vec![check(
            "node2",
            "service:redis",
            HealthStatus::Passing,
            "redis",
        )];
        // node2 does not carry beta, but the check is new to us.
        let updates =
            diff_service_checks("redis", Some("beta"), &checks, &HashMap::new(), &health).await;
        assert_eq!(updates.len(), 1);
        assert_eq!(
            updates.get("node2/service:redis").unwrap().tag.as_deref(),
            Some("beta")
        );
    }
}
