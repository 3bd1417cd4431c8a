use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};

use super::kv::{prefix_end, KvCompare, KvOp, KvStore};
use super::lock::{LockManager, Staged};
use super::Keyspace;
use crate::addr::{Addr, InstanceId};
use crate::clock::SharedClock;
use crate::error::RepoError;
use crate::filterset::InstanceFilterSet;
use crate::instance::Instance;
use crate::repository::InstanceRepository;

#[derive(Debug, Serialize, Deserialize)]
struct StoredInstance {
    instance: Instance,
    updated_at: DateTime<Utc>,
}

/// Instances as `instances/<hex id>` records plus a `bindings/<addr>` pointer
/// to the id currently owning each address. Writes are serialised per address.
pub struct InstanceSharedRepo {
    store: Arc<dyn KvStore>,
    keys: Keyspace,
    locks: LockManager,
    clock: SharedClock,
}

impl InstanceSharedRepo {
    pub fn new(
        store: Arc<dyn KvStore>,
        keys: Keyspace,
        locks: LockManager,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            keys,
            locks,
            clock,
        }
    }

    async fn read(&self, id: &InstanceId) -> Result<Option<StoredInstance>, RepoError> {
        match self.store.get(&self.keys.instance(id)).await? {
            Some(entry) => Ok(Some(serde_json::from_slice(&entry.value)?)),
            None => Ok(None),
        }
    }

    async fn bound_id(&self, addr: &Addr) -> Result<Option<String>, RepoError> {
        Ok(self
            .store
            .get(&self.keys.binding(addr))
            .await?
            .map(|entry| String::from_utf8_lossy(&entry.value).into_owned()))
    }

    /// Deletes `addr`'s binding, but only while it still points at `hex`.
    async fn unbind(&self, addr: &Addr, hex: &str) -> Result<(), RepoError> {
        let key = self.keys.binding(addr);
        self.store
            .txn(
                vec![KvCompare::Value(key.clone(), hex.as_bytes().to_vec())],
                vec![KvOp::delete(key)],
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl InstanceRepository for InstanceSharedRepo {
    async fn add(&self, instance: Instance) -> Result<Instance, RepoError> {
        let hex = instance.id.to_hex();
        let instance = &instance;
        let hex = hex.as_str();

        self.locks
            .guard_with_retry(&self.keys.instance_lock(&instance.addr), move || async move {
                let record = self.keys.instance(&instance.id);
                let binding = self.keys.binding(&instance.addr);
                let mut ops = Vec::new();
                let mut guards = Vec::new();

                // the id may be moving here from another address, which is
                // locked separately
                match self.store.get(&record).await? {
                    Some(entry) => {
                        guards.push(KvCompare::ModRevision(record.clone(), entry.mod_revision));
                        let previous: StoredInstance = serde_json::from_slice(&entry.value)?;
                        let old_addr = previous.instance.addr;
                        if old_addr != instance.addr {
                            let old_binding = self.keys.binding(&old_addr);
                            if let Some(bound) = self.store.get(&old_binding).await? {
                                if bound.value == hex.as_bytes() {
                                    guards.push(KvCompare::ModRevision(
                                        old_binding.clone(),
                                        bound.mod_revision,
                                    ));
                                    ops.push(KvOp::delete(old_binding));
                                }
                            }
                        }
                    }
                    None => guards.push(KvCompare::Absent(record.clone())),
                }

                match self.bound_id(&instance.addr).await? {
                    Some(old) => {
                        guards.push(KvCompare::Value(binding.clone(), old.as_bytes().to_vec()));
                        if old != hex {
                            let old = InstanceId::from_hex(&old)?;
                            debug!("Instance {} supersedes {} at {}", hex, old, instance.addr);
                            ops.push(KvOp::delete(self.keys.instance(&old)));
                        }
                    }
                    None => guards.push(KvCompare::Absent(binding.clone())),
                }

                let stored = StoredInstance {
                    instance: instance.clone(),
                    updated_at: self.clock.now(),
                };
                ops.push(KvOp::put(record, serde_json::to_vec(&stored)?));
                ops.push(KvOp::put(binding, hex));
                Ok(Staged {
                    ops,
                    guards,
                    value: stored.instance,
                })
            })
            .await
    }

    async fn get(&self, id: &InstanceId) -> Result<Instance, RepoError> {
        self.read(id)
            .await?
            .map(|stored| stored.instance)
            .ok_or(RepoError::NotFound)
    }

    async fn get_by_addr(&self, addr: &Addr) -> Result<Instance, RepoError> {
        let Some(hex) = self.bound_id(addr).await? else {
            return Err(RepoError::NotFound);
        };
        let id = InstanceId::from_hex(&hex)?;
        match self.read(&id).await? {
            Some(stored) if stored.instance.addr == *addr => Ok(stored.instance),
            _ => Err(RepoError::NotFound),
        }
    }

    async fn remove(&self, id: &InstanceId) -> Result<(), RepoError> {
        let Some(stored) = self.read(id).await? else {
            return Ok(());
        };
        let addr = stored.instance.addr;
        let hex = id.to_hex();
        let hex = hex.as_str();
        self.locks
            .guard_with_retry(&self.keys.instance_lock(&addr), move || async move {
                let mut ops = vec![KvOp::delete(self.keys.instance(id))];
                if self.bound_id(&addr).await?.as_deref() == Some(hex) {
                    ops.push(KvOp::delete(self.keys.binding(&addr)));
                }
                Ok(Staged::new(ops, ()))
            })
            .await
    }

    async fn clear(&self, fs: &InstanceFilterSet) -> Result<usize, RepoError> {
        let prefix = self.keys.instances();
        let entries = self.store.range(&prefix, &prefix_end(&prefix), None).await?;
        let mut removed = 0;
        for entry in entries {
            let stored: StoredInstance = serde_json::from_slice(&entry.value)?;
            if !fs.matches_updated(stored.updated_at) {
                continue;
            }
            let claimed = self
                .store
                .txn(
                    vec![KvCompare::ModRevision(entry.key.clone(), entry.mod_revision)],
                    vec![KvOp::delete(entry.key.as_str())],
                )
                .await?;
            if claimed {
                removed += 1;
                self.unbind(&stored.instance.addr, &stored.instance.id.to_hex())
                    .await?;
            }
        }
        Ok(removed)
    }

    async fn count(&self) -> Result<usize, RepoError> {
        let prefix = self.keys.instances();
        Ok(self.store.count(&prefix, &prefix_end(&prefix)).await?)
    }
}
