//! Daemon lifecycle: bootstrap, worker spawn, and graceful shutdown.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::alerts::SinkRegistry;
use crate::config::{Config, WatchMode};
use crate::discovery::{discover_nodes, discover_services, DiscoveryContext};
use crate::health::HealthSource;
use crate::kv::KvStore;
use crate::monitor::MonitorHandle;
use crate::state::Subject;

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("error contacting agent: {0}")]
    Bootstrap(String),
}

/// A running daemon instance. Dropping it leaks the workers; call
/// [`Daemon::shutdown`] to tear everything down and release the locks.
pub struct Daemon {
    workers: Vec<(mpsc::Sender<()>, JoinHandle<()>)>,
    local_node_monitor: Option<MonitorHandle>,
}

/// Bootstrap against the agent and start the discovery workers, building
/// the sink set from the configuration.
pub async fn start(
    config: Arc<Config>,
    kv: Arc<dyn KvStore>,
    health: Arc<dyn HealthSource>,
) -> Result<Daemon, DaemonError> {
    let sinks = SinkRegistry::build(&config);
    start_with_sinks(config, kv, health, sinks).await
}

/// Like [`start`], but with a caller-supplied sink set. Useful for
/// embedding the daemon with custom [`crate::alerts::AlertSink`]
/// implementations.
pub async fn start_with_sinks(
    config: Arc<Config>,
    kv: Arc<dyn KvStore>,
    health: Arc<dyn HealthSource>,
    sinks: SinkRegistry,
) -> Result<Daemon, DaemonError> {
    let agent = health
        .agent_info()
        .await
        .map_err(|e| DaemonError::Bootstrap(e.to_string()))?;
    let datacenter = config
        .datacenter
        .clone()
        .unwrap_or_else(|| agent.datacenter.clone());
    tracing::info!(datacenter = %datacenter, "Using datacenter");

    let ctx = Arc::new(DiscoveryContext {
        config: Arc::clone(&config),
        kv,
        health,
        sinks,
        node_name: agent.node_name.clone(),
        datacenter,
    });

    let mut workers = Vec::new();
    let (stop_tx, stop_rx) = mpsc::channel(1);
    workers.push((stop_tx, tokio::spawn(discover_services(Arc::clone(&ctx), stop_rx))));

    let local_node_monitor = match config.node_watch {
        WatchMode::Global => {
            tracing::info!("Discovering nodes from catalog");
            let (stop_tx, stop_rx) = mpsc::channel(1);
            workers.push((stop_tx, tokio::spawn(discover_nodes(Arc::clone(&ctx), stop_rx))));
            None
        }
        WatchMode::Local => {
            // The local node won't change, so no discovery is needed.
            tracing::info!(node = %agent.node_name, "Monitoring local node's checks");
            Some(ctx.spawn_monitor(Subject::node(agent.node_name.clone())))
        }
    };

    Ok(Daemon {
        workers,
        local_node_monitor,
    })
}

impl Daemon {
    /// Stop discovery workers and every monitor they spawned. Returns once
    /// all leader locks have been released.
    pub async fn shutdown(self) {
        tracing::info!("Releasing locks...");
        for (stop_tx, _) in &self.workers {
            let _ = stop_tx.send(()).await;
        }
        for (_, task) in self.workers {
            let _ = task.await;
        }
        if let Some(monitor) = self.local_node_monitor {
            monitor.stop().await;
        }
        tracing::info!("Shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::memory::MemoryHealth;
    use crate::health::HealthStatus;
    use crate::kv::memory::MemoryKv;
    use crate::testing::{channel_sink, expect_alert};
    use crate::state::AlertState;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    async fn start_test_daemon(
        mut config: Config,
        kv: &MemoryKv,
        health: &MemoryHealth,
        sink_id: &str,
    ) -> (Daemon, UnboundedReceiver<AlertState>) {
        config.change_threshold = 0;
        config.default_handlers = vec![sink_id.to_string()];

        let (sink, alerts) = channel_sink(sink_id);
        let mut sinks = SinkRegistry::new();
        sinks.insert(sink);

        let daemon = start_with_sinks(
            Arc::new(config),
            Arc::new(kv.clone()),
            Arc::new(health.clone()),
            sinks,
        )
        .await
        .unwrap();
        (daemon, alerts)
    }

    #[tokio::test]
    async fn test_alerts_on_existing_failing_service() {
        let kv = MemoryKv::new();
        let health = MemoryHealth::new("node1", "dc1");
        health.register_service("node1", "redis", &[], HealthStatus::Critical);

        let (daemon, mut alerts) = start_test_daemon(Config::default(), &kv, &health, "test").await;

        let alert = expect_alert(&mut alerts, HealthStatus::Critical).await;
        assert_eq!(alert.service, "redis");

        daemon.shutdown().await;
        assert!(!kv.lock_held("service/consul-alerting/service/redis/leader"));
    }

    #[tokio::test]
    async fn test_exactly_one_alert_across_two_instances() {
        let kv = MemoryKv::new();
        let health = MemoryHealth::new("node1", "dc1");
        health.register_service("node1", "redis", &[], HealthStatus::Passing);

        let (first, mut alerts_a) =
            start_test_daemon(Config::default(), &kv, &health, "test").await;
        let (second, mut alerts_b) =
            start_test_daemon(Config::default(), &kv, &health, "test").await;

        tokio::time::sleep(Duration::from_millis(1500)).await;
        health.register_service("node1", "redis", &[], HealthStatus::Critical);

        let mut received = Vec::new();
        let deadline = tokio::time::sleep(Duration::from_secs(3));
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                Some(alert) = alerts_a.recv() => received.push(alert),
                Some(alert) = alerts_b.recv() => received.push(alert),
                _ = &mut deadline => break,
            }
        }
        let service_alerts: Vec<_> =
            received.iter().filter(|a| a.service == "redis").collect();
        assert_eq!(service_alerts.len(), 1, "alerts: {:?}", received);

        first.shutdown().await;
        second.shutdown().await;
    }

    #[tokio::test]
    async fn test_global_node_watch_alerts_on_new_node() {
        let kv = MemoryKv::new();
        let health = MemoryHealth::new("node1", "dc1");

        let mut config = Config::default();
        config.node_watch = WatchMode::Global;
        let (daemon, mut alerts) = start_test_daemon(config, &kv, &health, "test").await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        health.add_node("node2");
        tokio::time::sleep(Duration::from_millis(1500)).await;
        health.set_check("node2", "nodecheck", HealthStatus::Critical, "down");

        let alert = expect_alert(&mut alerts, HealthStatus::Critical).await;
        assert_eq!(alert.node, "node2");

        daemon.shutdown().await;
    }
}
