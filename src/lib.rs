//! consul-alerting: a distributed alerting daemon for Consul-backed
//! clusters.
//!
//! Instances of the daemon discover services and nodes from the catalog
//! and race for a per-subject leader lock in the KV store. Only the lock
//! holder watches that subject's health; every instance persists check and
//! alert state in the KV tree so deduplication survives restarts and lock
//! handoffs. Detected status changes go through a quiescence window
//! (`change_threshold`) before the configured alert handlers fire, which
//! suppresses rapid flapping.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use consul_alerting::config::Config;
//! use consul_alerting::health::consul::ConsulHealth;
//! use consul_alerting::kv::consul::ConsulKv;
//!
//! # async fn run() {
//! let config = Arc::new(Config::default());
//! let kv = Arc::new(ConsulKv::new(&config.consul_address, &config.consul_token));
//! let health = Arc::new(ConsulHealth::new(
//!     &config.consul_address,
//!     &config.consul_token,
//!     config.datacenter.clone(),
//! ));
//!
//! let daemon = consul_alerting::daemon::start(config, kv, health)
//!     .await
//!     .expect("bootstrap failed");
//! // ... wait for a shutdown signal ...
//! daemon.shutdown().await;
//! # }
//! ```

pub mod alerts;
pub mod config;
pub mod daemon;
pub mod discovery;
pub mod health;
pub mod kv;
pub mod monitor;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use config::Config;
pub use health::{HealthCheck, HealthStatus};
pub use state::{AlertState, CheckState, Subject};
