//! In-memory `KvStore` for tests and embedded setups.
//!
//! Clones share state, so several daemon instances in one process can
//! cooperate through a single logical store the way separate processes
//! would through a real cluster.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;

use super::{KvError, KvStore, LockHandle};

#[derive(Clone, Default)]
pub struct MemoryKv {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    data: Mutex<HashMap<String, Vec<u8>>>,
    locks: Mutex<HashMap<String, Locker>>,
    released: Notify,
    next_session: AtomicU64,
}

struct Locker {
    session: String,
    lost_tx: watch::Sender<bool>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Force-revoke the session holding `key`, as if its lease expired.
    pub fn revoke_lock(&self, key: &str) {
        let locker = self.inner.locks.lock().remove(key);
        if let Some(locker) = locker {
            let _ = locker.lost_tx.send(true);
            self.inner.released.notify_waiters();
        }
    }

    /// Whether any session currently holds the lock at `key`.
    pub fn lock_held(&self, key: &str) -> bool {
        self.inner.locks.lock().contains_key(key)
    }

    fn try_grab(&self, key: &str) -> Option<LockHandle> {
        let mut locks = self.inner.locks.lock();
        if locks.contains_key(key) {
            return None;
        }
        let session = format!(
            "session-{}",
            self.inner.next_session.fetch_add(1, Ordering::SeqCst)
        );
        let (lost_tx, lost_rx) = watch::channel(false);
        locks.insert(
            key.to_string(),
            Locker {
                session: session.clone(),
                lost_tx,
            },
        );
        Some(LockHandle::new(key, session, lost_rx, None))
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.inner.data.lock().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), KvError> {
        self.inner.data.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.inner.data.lock().remove(key);
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        let mut keys: Vec<String> = self
            .inner
            .data
            .lock()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn acquire_lock(
        &self,
        key: &str,
        cancel: CancellationToken,
    ) -> Result<Option<LockHandle>, KvError> {
        loop {
            if let Some(handle) = self.try_grab(key) {
                return Ok(Some(handle));
            }
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            // The lock may have been released between the check and
            // subscribing to the notification.
            if let Some(handle) = self.try_grab(key) {
                return Ok(Some(handle));
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return Ok(None),
            }
        }
    }

    async fn release(&self, handle: LockHandle) -> Result<(), KvError> {
        let mut locks = self.inner.locks.lock();
        if let Some(locker) = locks.get(handle.key()) {
            if locker.session == handle.session() {
                locks.remove(handle.key());
            }
        }
        drop(locks);
        self.inner.released.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_put_get_delete() {
        let kv = MemoryKv::new();
        kv.put("a/b", b"value".to_vec()).await.unwrap();
        assert_eq!(kv.get("a/b").await.unwrap(), Some(b"value".to_vec()));

        kv.delete("a/b").await.unwrap();
        assert_eq!(kv.get("a/b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_keys_by_prefix() {
        let kv = MemoryKv::new();
        kv.put("svc/redis/check/n1/c1", vec![1]).await.unwrap();
        kv.put("svc/redis/check/n1/c2", vec![2]).await.unwrap();
        kv.put("svc/redis/alert", vec![3]).await.unwrap();

        let keys = kv.list_keys("svc/redis/check/").await.unwrap();
        assert_eq!(
            keys,
            vec![
                "svc/redis/check/n1/c1".to_string(),
                "svc/redis/check/n1/c2".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_lock_exclusivity() {
        let kv = MemoryKv::new();
        let handle = kv
            .acquire_lock("leader", CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        // A second acquisition attempt should block until release.
        let contender = kv.clone();
        let acquired = tokio::spawn(async move {
            contender
                .acquire_lock("leader", CancellationToken::new())
                .await
                .unwrap()
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!acquired.is_finished());

        kv.release(handle).await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), acquired)
            .await
            .unwrap()
            .unwrap();
        assert!(second.is_some());
    }

    #[tokio::test]
    async fn test_cancel_acquisition() {
        let kv = MemoryKv::new();
        let _held = kv
            .acquire_lock("leader", CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        let cancel = CancellationToken::new();
        let contender = kv.clone();
        let token = cancel.clone();
        let attempt =
            tokio::spawn(async move { contender.acquire_lock("leader", token).await.unwrap() });

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), attempt)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_revoke_fires_lost() {
        let kv = MemoryKv::new();
        let mut handle = kv
            .acquire_lock("leader", CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        kv.revoke_lock("leader");
        tokio::time::timeout(Duration::from_secs(1), handle.lost())
            .await
            .unwrap();

        // The lock is free again after revocation.
        assert!(!kv.lock_held("leader"));
    }
}
