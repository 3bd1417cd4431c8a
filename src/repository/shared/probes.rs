use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::kv::{prefix_end, KvCompare, KvOp, KvStore};
use super::{time_range, ts, Keyspace};
use crate::clock::SharedClock;
use crate::error::RepoError;
use crate::probe::Probe;
use crate::repository::{window_is_empty, ProbeRepository};

#[derive(Debug, Serialize, Deserialize)]
struct QueuedProbe {
    probe: Probe,
    /// Full precision; the key only carries whole microseconds.
    ready_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

/// Probe queue kept as `probes/<ready ts>/<seq>-<uuid>` keys. Poppers claim an
/// item by deleting it conditioned on its mod revision, so every item is
/// handed out at most once across instances.
pub struct ProbeSharedRepo {
    store: Arc<dyn KvStore>,
    keys: Keyspace,
    clock: SharedClock,
    seq: AtomicU64,
}

impl ProbeSharedRepo {
    pub fn new(store: Arc<dyn KvStore>, keys: Keyspace, clock: SharedClock) -> Self {
        Self {
            store,
            keys,
            clock,
            seq: AtomicU64::new(0),
        }
    }

    fn item_key(&self, ready_at: DateTime<Utc>) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!(
            "{}{}/{:012}-{}",
            self.keys.probes(),
            ts(ready_at),
            seq,
            Uuid::new_v4().simple()
        )
    }
}

#[async_trait]
impl ProbeRepository for ProbeSharedRepo {
    async fn add(&self, probe: Probe) -> Result<(), RepoError> {
        self.add_between(probe, None, None).await
    }

    async fn add_between(
        &self,
        probe: Probe,
        not_before: Option<DateTime<Utc>>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), RepoError> {
        if window_is_empty(not_before, expires_at) {
            return Ok(());
        }
        let ready_at = not_before.unwrap_or_else(|| self.clock.now());
        let key = self.item_key(ready_at);
        let value = serde_json::to_vec(&QueuedProbe {
            probe,
            ready_at,
            expires_at,
        })?;
        self.store.txn(Vec::new(), vec![KvOp::put(key, value)]).await?;
        Ok(())
    }

    async fn pop(&self) -> Result<Probe, RepoError> {
        let (mut probes, _) = self.pop_many(1).await?;
        probes.pop().ok_or(RepoError::QueueEmpty)
    }

    async fn pop_many(&self, count: usize) -> Result<(Vec<Probe>, usize), RepoError> {
        let mut probes = Vec::new();
        let mut expired = 0;
        if count == 0 {
            return Ok((probes, expired));
        }

        let now = self.clock.now();
        let prefix = self.keys.probes();
        let (mut start, end) = time_range(&prefix, None, Some(now));

        while probes.len() < count {
            let batch = self
                .store
                .range(&start, &end, Some(count - probes.len()))
                .await?;
            let Some(last) = batch.last() else {
                break;
            };
            // items left unclaimed below are not scanned again
            start = format!("{}\0", last.key);

            for entry in batch {
                let item = serde_json::from_slice::<QueuedProbe>(&entry.value);
                if item.as_ref().is_ok_and(|item| item.ready_at > now) {
                    continue;
                }
                let claimed = self
                    .store
                    .txn(
                        vec![KvCompare::ModRevision(entry.key.clone(), entry.mod_revision)],
                        vec![KvOp::delete(entry.key.as_str())],
                    )
                    .await?;
                if !claimed {
                    continue;
                }
                match item {
                    Ok(item) if item.expires_at.is_some_and(|exp| exp <= now) => expired += 1,
                    Ok(item) => probes.push(item.probe),
                    Err(e) => warn!("Dropping undecodable probe {}: {}", entry.key, e),
                }
            }
        }
        Ok((probes, expired))
    }

    async fn count(&self) -> Result<usize, RepoError> {
        let prefix = self.keys.probes();
        Ok(self.store.count(&prefix, &prefix_end(&prefix)).await?)
    }
}
