//! Acquisition loop for a subject's leader lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::KvStore;

/// How long to back off after lock contention or an acquisition error.
pub const LOCK_RETRY_WAIT: Duration = Duration::from_secs(15);

/// Callback invoked after every successful acquisition, before
/// [`LockSession::acquired`] starts returning true.
pub type AcquireCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Wraps one KV-backed lock and the loop that fights for it.
///
/// The owning monitor holds the session and reads [`LockSession::acquired`]
/// between iterations; the loop itself runs as a separate task.
pub struct LockSession {
    kv: Arc<dyn KvStore>,
    key: String,
    target: String,
    acquired: Arc<AtomicBool>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl LockSession {
    pub fn new(kv: Arc<dyn KvStore>, key: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kv,
            key: key.into(),
            target: target.into(),
            acquired: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    /// Spawn the acquisition loop. `on_acquired` runs to completion after
    /// each acquisition before `acquired()` begins returning true, so
    /// monitors never act on stale in-memory state.
    pub fn start(&mut self, on_acquired: AcquireCallback) {
        let kv = Arc::clone(&self.kv);
        let key = self.key.clone();
        let target = self.target.clone();
        let acquired = Arc::clone(&self.acquired);
        let cancel = self.cancel.clone();
        self.task = Some(tokio::spawn(run_loop(
            kv,
            key,
            target,
            acquired,
            cancel,
            on_acquired,
        )));
    }

    /// Whether this session currently holds the lock.
    pub fn acquired(&self) -> bool {
        self.acquired.load(Ordering::SeqCst)
    }

    /// Stop the loop, releasing the lock if held. Returns once the remote
    /// lock has been released.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.acquired.store(false, Ordering::SeqCst);
    }
}

async fn run_loop(
    kv: Arc<dyn KvStore>,
    key: String,
    target: String,
    acquired: Arc<AtomicBool>,
    cancel: CancellationToken,
    on_acquired: AcquireCallback,
) {
    while !cancel.is_cancelled() {
        tracing::debug!(target = %target, "Waiting to acquire lock");
        match kv.acquire_lock(&key, cancel.clone()).await {
            Ok(Some(mut handle)) => {
                on_acquired().await;
                acquired.store(true, Ordering::SeqCst);
                tracing::info!(target = %target, "Acquired lock");

                tokio::select! {
                    _ = handle.lost() => {
                        acquired.store(false, Ordering::SeqCst);
                        tracing::info!(target = %target, "Lost lock");
                        if let Err(e) = kv.release(handle).await {
                            tracing::warn!(target = %target, error = %e, "Error releasing lost lock");
                        }
                    }
                    _ = cancel.cancelled() => {
                        acquired.store(false, Ordering::SeqCst);
                        if let Err(e) = kv.release(handle).await {
                            tracing::warn!(target = %target, error = %e, "Error releasing lock on shutdown");
                        }
                        return;
                    }
                }
            }
            // Cancelled while waiting for the lock.
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(target = %target, error = %e, "Error acquiring lock, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(LOCK_RETRY_WAIT) => {}
                    _ = cancel.cancelled() => return,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::memory::MemoryKv;
    use std::sync::atomic::AtomicUsize;

    fn noop_callback() -> AcquireCallback {
        Arc::new(|| Box::pin(async {}))
    }

    async fn wait_until(session: &LockSession, held: bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while session.acquired() != held {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("lock session did not reach expected state");
    }

    #[tokio::test]
    async fn test_acquire_and_stop_releases() {
        let kv = MemoryKv::new();
        let mut session = LockSession::new(Arc::new(kv.clone()), "svc/leader", "redis");
        session.start(noop_callback());

        wait_until(&session, true).await;
        assert!(kv.lock_held("svc/leader"));

        session.stop().await;
        assert!(!session.acquired());
        assert!(!kv.lock_held("svc/leader"));
    }

    #[tokio::test]
    async fn test_callback_runs_before_acquired() {
        let kv = MemoryKv::new();
        let mut session = LockSession::new(Arc::new(kv), "svc/leader", "redis");

        let calls = Arc::new(AtomicUsize::new(0));
        let acquired_flag = Arc::clone(&session.acquired);
        let cb_calls = Arc::clone(&calls);
        session.start(Arc::new(move || {
            let calls = Arc::clone(&cb_calls);
            let acquired = Arc::clone(&acquired_flag);
            Box::pin(async move {
                // The session must not report acquired until we finish.
                assert!(!acquired.load(Ordering::SeqCst));
                calls.fetch_add(1, Ordering::SeqCst);
            })
        }));

        wait_until(&session, true).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        session.stop().await;
    }

    #[tokio::test]
    async fn test_reacquire_after_revocation() {
        let kv = MemoryKv::new();
        let mut session = LockSession::new(Arc::new(kv.clone()), "svc/leader", "redis");

        let calls = Arc::new(AtomicUsize::new(0));
        let cb_calls = Arc::clone(&calls);
        session.start(Arc::new(move || {
            let calls = Arc::clone(&cb_calls);
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        }));

        wait_until(&session, true).await;
        kv.revoke_lock("svc/leader");

        // The loop should fight its way back in and rerun the callback.
        tokio::time::timeout(Duration::from_secs(2), async {
            while calls.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("lock was not reacquired");
        wait_until(&session, true).await;
        session.stop().await;
    }
}
