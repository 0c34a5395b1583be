//! Typed key/value access to the backing store.
//!
//! The [`KvStore`] trait covers the small surface the daemon needs: blob
//! get/put/delete, prefix listing, and a session-backed distributed lock.
//! Adapters never retry; retry policy lives in the callers.

pub mod consul;
pub mod lock;
pub mod memory;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("network error: {0}")]
    Network(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("error decoding response: {0}")]
    Decode(String),

    #[error("session error: {0}")]
    Session(String),
}

/// Handle to a held distributed lock.
///
/// The handle resolves [`LockHandle::lost`] when the underlying session or
/// lease is revoked. Dropping the handle stops any background lease
/// keepalive, but remote bookkeeping is only cleaned up by
/// [`KvStore::release`].
pub struct LockHandle {
    key: String,
    session: String,
    lost: watch::Receiver<bool>,
    keepalive: Option<JoinHandle<()>>,
}

impl LockHandle {
    pub(crate) fn new(
        key: impl Into<String>,
        session: impl Into<String>,
        lost: watch::Receiver<bool>,
        keepalive: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            key: key.into(),
            session: session.into(),
            lost,
            keepalive,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// Resolves when the lock has been lost (session revoked or expired).
    pub async fn lost(&mut self) {
        loop {
            if *self.lost.borrow() {
                return;
            }
            // A dropped sender means the lock's owner state is gone.
            if self.lost.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if let Some(keepalive) = self.keepalive.take() {
            keepalive.abort();
        }
    }
}

/// Adapter over a logical keyed namespace in the backing store.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), KvError>;

    async fn delete(&self, key: &str) -> Result<(), KvError>;

    /// Full key paths under `prefix`.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, KvError>;

    /// Block until the lock at `key` is granted or `cancel` fires.
    /// Returns `Ok(None)` when cancelled.
    async fn acquire_lock(
        &self,
        key: &str,
        cancel: CancellationToken,
    ) -> Result<Option<LockHandle>, KvError>;

    /// Release the lock and destroy any remote bookkeeping.
    async fn release(&self, handle: LockHandle) -> Result<(), KvError>;
}
