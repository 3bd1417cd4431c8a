//! In-process [`KvStore`] with etcd semantics: a global revision counter,
//! per-key mod revisions, all-or-nothing transactions and leases whose keys
//! vanish when the lease runs out on the injected clock.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::kv::{lease_secs, KvCompare, KvEntry, KvOp, KvStore};
use crate::clock::SharedClock;
use crate::error::StoreError;

struct Entry {
    value: Vec<u8>,
    mod_revision: i64,
    lease: Option<i64>,
}

#[derive(Default)]
struct State {
    revision: i64,
    entries: BTreeMap<String, Entry>,
    leases: HashMap<i64, DateTime<Utc>>,
    next_lease: i64,
}

impl State {
    fn expire(&mut self, now: DateTime<Utc>) {
        let dead: Vec<i64> = self
            .leases
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        if dead.is_empty() {
            return;
        }
        for id in &dead {
            self.leases.remove(id);
        }
        self.entries
            .retain(|_, entry| !entry.lease.is_some_and(|id| dead.contains(&id)));
        self.revision += 1;
    }

    fn holds(&self, cmp: &KvCompare) -> bool {
        match cmp {
            KvCompare::Value(key, value) => self
                .entries
                .get(key)
                .is_some_and(|entry| &entry.value == value),
            KvCompare::Absent(key) => !self.entries.contains_key(key),
            KvCompare::ModRevision(key, rev) => self
                .entries
                .get(key)
                .is_some_and(|entry| entry.mod_revision == *rev),
        }
    }
}

pub struct MemoryKv {
    clock: SharedClock,
    state: Mutex<State>,
}

impl MemoryKv {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.expire(self.clock.now());
        state
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn scan<'a>(
    state: &'a State,
    start: &str,
    end: &str,
) -> impl Iterator<Item = (&'a String, &'a Entry)> + 'a {
    let end = end.to_string();
    state
        .entries
        .range(start.to_string()..)
        .take_while(move |(key, _)| key.as_str() < end.as_str())
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, StoreError> {
        let state = self.lock();
        Ok(state.entries.get(key).map(|entry| KvEntry {
            key: key.to_string(),
            value: entry.value.clone(),
            mod_revision: entry.mod_revision,
        }))
    }

    async fn range(
        &self,
        start: &str,
        end: &str,
        limit: Option<usize>,
    ) -> Result<Vec<KvEntry>, StoreError> {
        let state = self.lock();
        Ok(scan(&state, start, end)
            .take(limit.unwrap_or(usize::MAX))
            .map(|(key, entry)| KvEntry {
                key: key.clone(),
                value: entry.value.clone(),
                mod_revision: entry.mod_revision,
            })
            .collect())
    }

    async fn count(&self, start: &str, end: &str) -> Result<usize, StoreError> {
        let state = self.lock();
        Ok(scan(&state, start, end).count())
    }

    async fn txn(&self, compares: Vec<KvCompare>, ops: Vec<KvOp>) -> Result<bool, StoreError> {
        let mut state = self.lock();
        if !compares.iter().all(|cmp| state.holds(cmp)) {
            return Ok(false);
        }
        for op in &ops {
            if let KvOp::Put {
                lease: Some(id), ..
            } = op
            {
                if !state.leases.contains_key(id) {
                    return Err(StoreError::LeaseNotFound(*id));
                }
            }
        }
        if ops.is_empty() {
            return Ok(true);
        }
        state.revision += 1;
        let revision = state.revision;
        for op in ops {
            match op {
                KvOp::Put { key, value, lease } => {
                    state.entries.insert(
                        key,
                        Entry {
                            value,
                            mod_revision: revision,
                            lease,
                        },
                    );
                }
                KvOp::Delete { key } => {
                    state.entries.remove(&key);
                }
            }
        }
        Ok(true)
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<i64, StoreError> {
        let deadline = self.clock.now() + chrono::Duration::seconds(lease_secs(ttl));
        let mut state = self.lock();
        state.next_lease += 1;
        let id = state.next_lease;
        state.leases.insert(id, deadline);
        Ok(id)
    }

    async fn revoke_lease(&self, lease: i64) -> Result<(), StoreError> {
        let mut state = self.lock();
        if state.leases.remove(&lease).is_none() {
            return Err(StoreError::LeaseNotFound(lease));
        }
        state
            .entries
            .retain(|_, entry| entry.lease != Some(lease));
        state.revision += 1;
        Ok(())
    }
}
