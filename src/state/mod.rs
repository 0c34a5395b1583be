//! Durable per-subject state stored in the KV tree.
//!
//! Each monitored subject owns a sub-tree under the configured root:
//! a `leader` lock key, an `alert` blob holding the [`AlertState`], and one
//! `check/<node>/<check_id>` blob per known health check. Blobs are JSON
//! records; unknown fields are ignored on decode and an empty blob decodes
//! to "absent", so independent daemon versions can round-trip each other's
//! state.

use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::health::HealthStatus;
use crate::kv::{KvError, KvStore};

/// Default KV root under which all alerting state lives.
pub const DEFAULT_KV_ROOT: &str = "service/consul-alerting";

/// A monitored entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subject {
    /// All non-service checks on the named node.
    Node { node: String },
    /// All checks of a named service across the cluster, regardless of tag.
    Service { service: String },
    /// Checks of a service restricted to instances carrying `tag`.
    ServiceTag { service: String, tag: String },
}

impl Subject {
    pub fn node(node: impl Into<String>) -> Self {
        Subject::Node { node: node.into() }
    }

    pub fn service(service: impl Into<String>) -> Self {
        Subject::Service {
            service: service.into(),
        }
    }

    pub fn service_tag(service: impl Into<String>, tag: impl Into<String>) -> Self {
        Subject::ServiceTag {
            service: service.into(),
            tag: tag.into(),
        }
    }

    /// The service name, for service subjects.
    pub fn service_name(&self) -> Option<&str> {
        match self {
            Subject::Node { .. } => None,
            Subject::Service { service } | Subject::ServiceTag { service, .. } => Some(service),
        }
    }

    /// The node name, for node subjects.
    pub fn node_name(&self) -> Option<&str> {
        match self {
            Subject::Node { node } => Some(node),
            _ => None,
        }
    }

    pub fn tag(&self) -> Option<&str> {
        match self {
            Subject::ServiceTag { tag, .. } => Some(tag),
            _ => None,
        }
    }

    /// KV prefix of this subject's sub-tree, with a trailing slash.
    pub fn kv_prefix(&self, root: &str) -> String {
        match self {
            Subject::Node { node } => format!("{}/node/{}/", root, node),
            Subject::Service { service } => format!("{}/service/{}/", root, service),
            Subject::ServiceTag { service, tag } => {
                format!("{}/service/{}/{}/", root, service, tag)
            }
        }
    }

    /// Key of the leader lock for this subject.
    pub fn leader_key(&self, root: &str) -> String {
        format!("{}leader", self.kv_prefix(root))
    }

    /// Key of the subject's [`AlertState`] blob.
    pub fn alert_key(&self, root: &str) -> String {
        format!("{}alert", self.kv_prefix(root))
    }

    /// Prefix under which per-check state blobs live.
    pub fn check_prefix(&self, root: &str) -> String {
        format!("{}check/", self.kv_prefix(root))
    }

    /// Key of the state blob for one check.
    pub fn check_key(&self, root: &str, node: &str, check_id: &str) -> String {
        format!("{}{}/{}", self.check_prefix(root), node, check_id)
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::Node { node } => write!(f, "node '{}'", node),
            Subject::Service { service } => write!(f, "service '{}'", service),
            Subject::ServiceTag { service, tag } => {
                write!(f, "service '{}' (tag: {})", service, tag)
            }
        }
    }
}

/// Last known status of a single health check, persisted so alert state
/// survives restarts and lock handoffs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckState {
    pub status: HealthStatus,
}

/// The last known state of a subject's alert, stored at the subject's
/// `alert` key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertState {
    #[serde(default)]
    pub status: HealthStatus,
    #[serde(default)]
    pub node: String,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub tag: String,
    /// Bumped on every write while holding the subject's leader lock;
    /// lets a quiescence attempt detect that it has been superseded.
    #[serde(default)]
    pub update_index: u64,
    /// The last status for which a sink emission was attempted.
    #[serde(default)]
    pub last_alerted: HealthStatus,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub details: String,
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("error encoding state: {0}")]
    Encode(String),

    #[error("error parsing state: {0}")]
    Decode(String),
}

/// Serialize a state record to its KV blob form.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(value).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Parse a state record from a KV blob. An empty blob decodes to "absent".
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<Option<T>, CodecError> {
    if bytes.is_empty() {
        return Ok(None);
    }
    serde_json::from_slice(bytes)
        .map(Some)
        .map_err(|e| CodecError::Decode(e.to_string()))
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("kv error: {0}")]
    Kv(#[from] KvError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Read and decode the blob at `key`. A missing or empty blob is absent;
/// a corrupt blob is treated as absent and logged.
pub async fn load_state<T: DeserializeOwned>(
    kv: &dyn KvStore,
    key: &str,
) -> Result<Option<T>, StateError> {
    let bytes = match kv.get(key).await? {
        Some(bytes) => bytes,
        None => return Ok(None),
    };
    match decode(&bytes) {
        Ok(value) => Ok(value),
        Err(e) => {
            tracing::warn!(key, error = %e, "Discarding corrupt state blob");
            Ok(None)
        }
    }
}

/// Encode `value` and write it at `key`.
pub async fn store_state<T: Serialize>(
    kv: &dyn KvStore,
    key: &str,
    value: &T,
) -> Result<(), StateError> {
    let bytes = encode(value)?;
    kv.put(key, bytes).await?;
    Ok(())
}

/// Load all check states under `prefix` into a `node/check_id` -> status map.
///
/// Corrupt or empty entries are skipped; they get repopulated on the next
/// diff cycle.
pub async fn load_check_states(
    kv: &dyn KvStore,
    prefix: &str,
) -> Result<HashMap<String, HealthStatus>, StateError> {
    let mut states = HashMap::new();
    for key in kv.list_keys(prefix).await? {
        let check: Option<CheckState> = load_state(kv, &key).await?;
        let check = match check {
            Some(check) => check,
            None => continue,
        };
        let id = match key.strip_prefix(prefix) {
            Some(rel) => rel.to_string(),
            None => continue,
        };
        states.insert(id, check.status);
    }
    Ok(states)
}
