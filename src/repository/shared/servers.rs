use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::kv::{prefix_end, KvOp, KvStore};
use super::lock::{LockManager, Staged};
use super::{split_time_key, time_range, ts, Keyspace};
use crate::addr::Addr;
use crate::clock::SharedClock;
use crate::error::RepoError;
use crate::filterset::ServerFilterSet;
use crate::repository::{OnConflict, ServerRepository};
use crate::server::Server;
use crate::status::DiscoveryStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredServer {
    server: Server,
    updated_at: DateTime<Utc>,
}

pub struct ServerSharedRepo {
    store: Arc<dyn KvStore>,
    keys: Keyspace,
    locks: LockManager,
    clock: SharedClock,
}

impl ServerSharedRepo {
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

    async fn read(&self, addr: &Addr) -> Result<Option<StoredServer>, RepoError> {
        match self.store.get(&self.keys.server(addr)).await? {
            Some(entry) => Ok(Some(serde_json::from_slice(&entry.value)?)),
            None => Ok(None),
        }
    }

    fn index_keys(&self, stored: &StoredServer) -> BTreeSet<String> {
        let addr = stored.server.addr;
        let mut keys = BTreeSet::new();
        keys.insert(format!("{}{}/{}", self.keys.updated(), ts(stored.updated_at), addr));
        if let Some(refreshed_at) = stored.server.refreshed_at {
            keys.insert(format!("{}{}/{}", self.keys.refreshed(), ts(refreshed_at), addr));
        }
        for flag in stored.server.discovery_status.iter() {
            if let Some(name) = flag.name() {
                keys.insert(format!("{}{}", self.keys.status(name), addr));
            }
        }
        keys
    }

    /// Record put plus the index diff. A key never appears twice in one batch.
    fn write_ops(
        &self,
        old: Option<&StoredServer>,
        new: &StoredServer,
    ) -> Result<Vec<KvOp>, RepoError> {
        let addr = new.server.addr.to_string();
        let new_keys = self.index_keys(new);
        let old_keys = old.map(|old| self.index_keys(old)).unwrap_or_default();

        let mut ops = vec![KvOp::put(
            self.keys.server(&new.server.addr),
            serde_json::to_vec(new)?,
        )];
        ops.extend(old_keys.difference(&new_keys).map(KvOp::delete));
        ops.extend(
            new_keys
                .difference(&old_keys)
                .map(|key| KvOp::put(key.as_str(), addr.as_bytes())),
        );
        Ok(ops)
    }

    fn delete_ops(&self, old: &StoredServer) -> Vec<KvOp> {
        let mut ops = vec![KvOp::delete(self.keys.server(&old.server.addr))];
        ops.extend(self.index_keys(old).into_iter().map(KvOp::delete));
        ops
    }

    async fn members(&self, prefix: &str) -> Result<HashSet<Addr>, RepoError> {
        let entries = self.store.range(prefix, &prefix_end(prefix), None).await?;
        let mut members = HashSet::with_capacity(entries.len());
        for entry in &entries {
            if let Some(addr) = entry.key.strip_prefix(prefix) {
                members.insert(addr.parse()?);
            }
        }
        Ok(members)
    }

    async fn indexed(
        &self,
        prefix: &str,
        after: Option<DateTime<Utc>>,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<(i64, Addr)>, RepoError> {
        let (start, end) = time_range(prefix, after, before);
        let entries = self.store.range(&start, &end, None).await?;
        let mut indexed = Vec::with_capacity(entries.len());
        for entry in &entries {
            let (micros, addr) = split_time_key(prefix, &entry.key)?;
            indexed.push((micros, addr.parse()?));
        }
        Ok(indexed)
    }
}

#[async_trait]
impl ServerRepository for ServerSharedRepo {
    async fn get(&self, addr: &Addr) -> Result<Server, RepoError> {
        self.read(addr)
            .await?
            .map(|stored| stored.server)
            .ok_or(RepoError::NotFound)
    }

    async fn add(&self, server: Server, on_conflict: &OnConflict<'_>) -> Result<Server, RepoError> {
        let addr = server.addr;
        let server = &server;
        self.locks
            .guard_with_retry(&self.keys.server_lock(&addr), move || async move {
                let current = self.read(&addr).await?;
                let next = match &current {
                    None => Server {
                        version: 1,
                        ..server.clone()
                    },
                    Some(stored) => {
                        let mut existing = stored.server.clone();
                        if !on_conflict(&mut existing) {
                            return Err(RepoError::AlreadyExists);
                        }
                        existing.addr = addr;
                        existing.version = stored.server.version + 1;
                        existing
                    }
                };
                let next = StoredServer {
                    server: next,
                    updated_at: self.clock.now(),
                };
                let ops = self.write_ops(current.as_ref(), &next)?;
                Ok(Staged::new(ops, next.server))
            })
            .await
    }

    async fn update(
        &self,
        server: Server,
        on_conflict: &OnConflict<'_>,
    ) -> Result<Server, RepoError> {
        let addr = server.addr;
        let server = &server;
        self.locks
            .guard_with_retry(&self.keys.server_lock(&addr), move || async move {
                let Some(current) = self.read(&addr).await? else {
                    return Err(RepoError::NotFound);
                };
                let mut next = if current.server.version > server.version {
                    let mut existing = current.server.clone();
                    if !on_conflict(&mut existing) {
                        return Ok(Staged::read_only(current.server));
                    }
                    existing.addr = addr;
                    existing
                } else {
                    server.clone()
                };
                next.version = current.server.version + 1;
                let next = StoredServer {
                    server: next,
                    updated_at: self.clock.now(),
                };
                let ops = self.write_ops(Some(&current), &next)?;
                Ok(Staged::new(ops, next.server))
            })
            .await
    }

    async fn remove(&self, server: &Server, on_conflict: &OnConflict<'_>) -> Result<(), RepoError> {
        let addr = server.addr;
        self.locks
            .guard_with_retry(&self.keys.server_lock(&addr), move || async move {
                let Some(current) = self.read(&addr).await? else {
                    return Ok(Staged::read_only(()));
                };
                if current.server.version > server.version {
                    let mut existing = current.server.clone();
                    if !on_conflict(&mut existing) {
                        return Ok(Staged::read_only(()));
                    }
                }
                Ok(Staged::new(self.delete_ops(&current), ()))
            })
            .await
    }

    async fn filter(&self, fs: &ServerFilterSet) -> Result<Vec<Server>, RepoError> {
        let (after, before) = fs.get_updated_range();
        let mut candidates = self.indexed(&self.keys.updated(), after, before).await?;

        if fs.has_active_bounds() {
            let (after, before) = fs.get_active_range();
            let active: HashSet<Addr> = self
                .indexed(&self.keys.refreshed(), after, before)
                .await?
                .into_iter()
                .map(|(_, addr)| addr)
                .collect();
            candidates.retain(|(_, addr)| active.contains(addr));
        }
        if let Some(with) = fs.get_with_status() {
            for flag in with.iter() {
                let Some(name) = flag.name() else { continue };
                let members = self.members(&self.keys.status(name)).await?;
                candidates.retain(|(_, addr)| members.contains(addr));
            }
        }
        if let Some(without) = fs.get_no_status() {
            for flag in without.iter() {
                let Some(name) = flag.name() else { continue };
                let members = self.members(&self.keys.status(name)).await?;
                candidates.retain(|(_, addr)| !members.contains(addr));
            }
        }

        // newest first, ties by address like the memory backend
        candidates.sort_by(|a, b| b.cmp(a));

        let limit = fs.get_limit().unwrap_or(usize::MAX);
        let mut seen = HashSet::new();
        let mut servers = Vec::new();
        for (_, addr) in candidates {
            if servers.len() >= limit {
                break;
            }
            if !seen.insert(addr) {
                continue;
            }
            // indices are read separately from records; recheck against the record
            let Some(stored) = self.read(&addr).await? else {
                continue;
            };
            if fs.matches(
                stored.server.discovery_status,
                stored.updated_at,
                stored.server.refreshed_at,
            ) {
                servers.push(stored.server);
            }
        }
        Ok(servers)
    }

    async fn count(&self) -> Result<usize, RepoError> {
        let prefix = self.keys.servers();
        Ok(self.store.count(&prefix, &prefix_end(&prefix)).await?)
    }

    async fn count_by_status(&self) -> Result<HashMap<DiscoveryStatus, usize>, RepoError> {
        let mut counts = HashMap::new();
        for (flag, name) in DiscoveryStatus::FLAGS {
            let prefix = self.keys.status(name);
            let count = self.store.count(&prefix, &prefix_end(&prefix)).await?;
            counts.insert(flag, count);
        }
        Ok(counts)
    }
}
