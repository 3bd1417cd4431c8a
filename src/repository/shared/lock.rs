//! Distributed lock manager.
//!
//! A lock is a key created only if absent, carrying a random token and bound
//! to a lease so it disappears on its own when the holder dies. The critical
//! section does not write to the store directly: it returns [`Staged`] writes
//! that are committed in one transaction guarded by "the lock key still holds
//! my token". If the lease ran out and someone else claimed the key in the
//! meantime, nothing is written and the caller sees `NotAcquired`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use log::{debug, warn};
use uuid::Uuid;

use super::kv::{KvCompare, KvOp, KvStore};
use crate::error::{LockError, RepoError};

pub const DEFAULT_TTL: Duration = Duration::from_secs(5);
pub const DEFAULT_ATTEMPTS: usize = 5;

/// Writes produced by a critical section, plus the value handed back to the
/// caller once they are committed.
#[derive(Debug)]
pub struct Staged<T> {
    pub ops: Vec<KvOp>,
    /// Checked together with lock ownership. Used for keys the section read
    /// that the lock does not cover.
    pub guards: Vec<KvCompare>,
    pub value: T,
}

impl<T> Staged<T> {
    pub fn new(ops: Vec<KvOp>, value: T) -> Self {
        Self {
            ops,
            guards: Vec::new(),
            value,
        }
    }

    /// Nothing to write.
    pub fn read_only(value: T) -> Self {
        Self::new(Vec::new(), value)
    }
}

#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn KvStore>,
    ttl: Duration,
    attempts: usize,
}

impl LockManager {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            ttl: DEFAULT_TTL,
            attempts: DEFAULT_ATTEMPTS,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_attempts(mut self, attempts: usize) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    /// Runs `f` while holding `key`. Fails immediately with `NotAcquired` if
    /// the key is held, and also if ownership is lost before the staged writes
    /// land.
    pub async fn guard<T, F, Fut>(&self, key: &str, ttl: Duration, f: F) -> Result<T, RepoError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<Staged<T>, RepoError>> + Send,
        T: Send,
    {
        let token = Uuid::new_v4().to_string();
        let lease = self.store.grant_lease(ttl).await?;

        let acquired = self
            .store
            .txn(
                vec![KvCompare::Absent(key.to_string())],
                vec![KvOp::put_with_lease(key, token.as_bytes(), lease)],
            )
            .await;
        match acquired {
            Ok(true) => {}
            Ok(false) => {
                debug!("Lock {} is held by another writer", key);
                self.revoke(lease).await;
                return Err(LockError::NotAcquired(key.to_string()).into());
            }
            Err(e) => {
                self.revoke(lease).await;
                return Err(e.into());
            }
        }

        let outcome = self.run_owned(key, &token, f).await;
        self.release(key, &token, lease).await;
        outcome
    }

    /// [`guard`](Self::guard) with the configured ttl, retrying contention with
    /// exponential backoff for a bounded number of attempts.
    pub async fn guard_with_retry<T, F, Fut>(&self, key: &str, mut f: F) -> Result<T, RepoError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<Staged<T>, RepoError>> + Send,
        T: Send,
    {
        let mut backoff = ExponentialBackoff {
            current_interval: Duration::from_millis(20),
            initial_interval: Duration::from_millis(20),
            max_interval: Duration::from_millis(500),
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.guard(key, self.ttl, &mut f).await {
                Err(e) if e.is_contention() => {
                    if attempt >= self.attempts {
                        return Err(LockError::Exhausted {
                            key: key.to_string(),
                            attempts: attempt,
                        }
                        .into());
                    }
                    let delay = backoff.next_backoff().unwrap_or(backoff.max_interval);
                    debug!("Lock {} contended (attempt {}), retrying in {:?}", key, attempt, delay);
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    async fn run_owned<T, F, Fut>(&self, key: &str, token: &str, f: F) -> Result<T, RepoError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Staged<T>, RepoError>>,
    {
        let staged = f().await?;
        if staged.ops.is_empty() {
            return Ok(staged.value);
        }
        let stale_reads = !staged.guards.is_empty();
        let mut compares = staged.guards;
        compares.push(KvCompare::Value(key.to_string(), token.as_bytes().to_vec()));
        let committed = self.store.txn(compares, staged.ops).await?;
        if !committed {
            if stale_reads {
                debug!("Writes under lock {} raced an outside change, discarded", key);
            } else {
                warn!("Lost ownership of lock {}, writes discarded", key);
            }
            return Err(LockError::NotAcquired(key.to_string()).into());
        }
        Ok(staged.value)
    }

    /// Best effort. The lease bounds how long a failed release can linger.
    async fn release(&self, key: &str, token: &str, lease: i64) {
        if let Err(e) = self
            .store
            .txn(
                vec![KvCompare::Value(key.to_string(), token.as_bytes().to_vec())],
                vec![KvOp::delete(key)],
            )
            .await
        {
            warn!("Failed to release lock {}: {}", key, e);
        }
        self.revoke(lease).await;
    }

    async fn revoke(&self, lease: i64) {
        if let Err(e) = self.store.revoke_lease(lease).await {
            debug!("Failed to revoke lease {}: {}", lease, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::oneshot;

    use super::*;
    use crate::clock::ManualClock;
    use crate::repository::shared::memkv::MemoryKv;

    fn setup() -> (Arc<ManualClock>, Arc<MemoryKv>, LockManager) {
        let clock = Arc::new(ManualClock::default());
        let kv = Arc::new(MemoryKv::new(clock.clone()));
        let locks = LockManager::new(kv.clone()).with_attempts(3);
        (clock, kv, locks)
    }

    #[tokio::test]
    async fn commits_staged_writes_and_releases() {
        let (_, kv, locks) = setup();
        let value = locks
            .guard("lock:x", DEFAULT_TTL, || async {
                Ok(Staged::new(vec![KvOp::put("data", "written")], 42))
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(kv.get("data").await.unwrap().unwrap().value, b"written");
        assert!(kv.get("lock:x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn second_claimant_is_rejected_without_side_effects() {
        let (_, kv, locks) = setup();
        let runs = Arc::new(AtomicUsize::new(0));
        let (entered_tx, entered_rx) = oneshot::channel::<()>();
        let (resume_tx, resume_rx) = oneshot::channel::<()>();

        let first = {
            let locks = locks.clone();
            let runs = runs.clone();
            tokio::spawn(async move {
                locks
                    .guard("lock:x", DEFAULT_TTL, || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        let _ = entered_tx.send(());
                        let _ = resume_rx.await;
                        Ok(Staged::new(vec![KvOp::put("first", "1")], ()))
                    })
                    .await
            })
        };

        entered_rx.await.unwrap();
        let second = locks
            .guard("lock:x", DEFAULT_TTL, || {
                let runs = runs.clone();
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(Staged::new(vec![KvOp::put("second", "1")], ()))
                }
            })
            .await;
        resume_tx.send(()).unwrap();

        assert!(matches!(second, Err(RepoError::Lock(LockError::NotAcquired(_)))));
        first.await.unwrap().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(kv.get("first").await.unwrap().is_some());
        assert!(kv.get("second").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lost_ownership_discards_writes() {
        let (clock, kv, locks) = setup();
        let intruder = kv.clone();
        let result = locks
            .guard("lock:x", Duration::from_secs(1), || async move {
                clock.advance(chrono::Duration::seconds(2));
                let claimed = intruder
                    .txn(
                        vec![KvCompare::Absent("lock:x".into())],
                        vec![KvOp::put("lock:x", "intruder")],
                    )
                    .await?;
                assert!(claimed);
                Ok(Staged::new(vec![KvOp::put("data", "stale")], ()))
            })
            .await;

        assert!(matches!(result, Err(RepoError::Lock(LockError::NotAcquired(_)))));
        assert!(kv.get("data").await.unwrap().is_none());
        // the intruder's lock was not released on its behalf
        assert_eq!(kv.get("lock:x").await.unwrap().unwrap().value, b"intruder");
    }

    #[tokio::test]
    async fn outside_change_to_guarded_key_discards_writes() {
        let (_, kv, locks) = setup();
        kv.txn(Vec::new(), vec![KvOp::put("other", "v1")]).await.unwrap();
        let seen = kv.get("other").await.unwrap().unwrap();
        let writer = kv.clone();
        let result = locks
            .guard("lock:x", DEFAULT_TTL, || async move {
                writer
                    .txn(Vec::new(), vec![KvOp::put("other", "v2")])
                    .await?;
                Ok(Staged {
                    ops: vec![KvOp::put("data", "stale")],
                    guards: vec![KvCompare::ModRevision("other".into(), seen.mod_revision)],
                    value: (),
                })
            })
            .await;

        assert!(matches!(result, Err(RepoError::Lock(LockError::NotAcquired(_)))));
        assert!(kv.get("data").await.unwrap().is_none());
        assert!(kv.get("lock:x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let (_, kv, locks) = setup();
        kv.txn(Vec::new(), vec![KvOp::put("lock:x", "someone")])
            .await
            .unwrap();
        let result = locks
            .guard_with_retry("lock:x", || async { Ok(Staged::read_only(())) })
            .await;
        assert!(matches!(
            result,
            Err(RepoError::Lock(LockError::Exhausted { attempts: 3, .. }))
        ));
    }

    #[tokio::test]
    async fn section_errors_propagate_and_release() {
        let (_, kv, locks) = setup();
        let result: Result<(), _> = locks
            .guard("lock:x", DEFAULT_TTL, || async { Err(RepoError::NotFound) })
            .await;
        assert!(matches!(result, Err(RepoError::NotFound)));
        assert!(kv.get("lock:x").await.unwrap().is_none());
    }
}
