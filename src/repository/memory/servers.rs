use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::addr::Addr;
use crate::clock::SharedClock;
use crate::error::RepoError;
use crate::filterset::ServerFilterSet;
use crate::repository::{OnConflict, ServerRepository};
use crate::server::Server;
use crate::status::DiscoveryStatus;

struct Record {
    server: Server,
    updated_at: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    records: HashMap<Addr, Record>,
    /// (last updated, addr), oldest first.
    history: BTreeSet<(DateTime<Utc>, Addr)>,
}

impl State {
    fn store(&mut self, server: Server, now: DateTime<Utc>) -> Server {
        let addr = server.addr;
        if let Some(old) = self.records.get(&addr) {
            self.history.remove(&(old.updated_at, addr));
        }
        self.history.insert((now, addr));
        self.records.insert(
            addr,
            Record {
                server: server.clone(),
                updated_at: now,
            },
        );
        server
    }

    fn delete(&mut self, addr: &Addr) {
        if let Some(old) = self.records.remove(addr) {
            self.history.remove(&(old.updated_at, *addr));
        }
    }
}

pub struct ServerMemoryRepo {
    clock: SharedClock,
    state: RwLock<State>,
}

impl ServerMemoryRepo {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            state: RwLock::new(State::default()),
        }
    }
}

#[async_trait]
impl ServerRepository for ServerMemoryRepo {
    async fn get(&self, addr: &Addr) -> Result<Server, RepoError> {
        let state = self.state.read().await;
        state
            .records
            .get(addr)
            .map(|rec| rec.server.clone())
            .ok_or(RepoError::NotFound)
    }

    async fn add(&self, server: Server, on_conflict: &OnConflict<'_>) -> Result<Server, RepoError> {
        let mut state = self.state.write().await;
        let next = match state.records.get(&server.addr) {
            None => Server {
                version: 1,
                ..server
            },
            Some(rec) => {
                let mut existing = rec.server.clone();
                if !on_conflict(&mut existing) {
                    return Err(RepoError::AlreadyExists);
                }
                existing.addr = rec.server.addr;
                existing.version = rec.server.version + 1;
                existing
            }
        };
        Ok(state.store(next, self.clock.now()))
    }

    async fn update(
        &self,
        server: Server,
        on_conflict: &OnConflict<'_>,
    ) -> Result<Server, RepoError> {
        let mut state = self.state.write().await;
        let Some(rec) = state.records.get(&server.addr) else {
            return Err(RepoError::NotFound);
        };
        let stored_version = rec.server.version;
        let mut next = if stored_version > server.version {
            let mut existing = rec.server.clone();
            if !on_conflict(&mut existing) {
                return Ok(rec.server.clone());
            }
            existing.addr = rec.server.addr;
            existing
        } else {
            server
        };
        next.version = stored_version + 1;
        Ok(state.store(next, self.clock.now()))
    }

    async fn remove(&self, server: &Server, on_conflict: &OnConflict<'_>) -> Result<(), RepoError> {
        let mut state = self.state.write().await;
        let Some(rec) = state.records.get(&server.addr) else {
            return Ok(());
        };
        if rec.server.version > server.version {
            let mut existing = rec.server.clone();
            if !on_conflict(&mut existing) {
                return Ok(());
            }
        }
        state.delete(&server.addr);
        Ok(())
    }

    async fn filter(&self, fs: &ServerFilterSet) -> Result<Vec<Server>, RepoError> {
        let state = self.state.read().await;
        let (after, before) = fs.get_updated_range();
        let limit = fs.get_limit().unwrap_or(usize::MAX);
        let mut servers = Vec::new();
        for (updated_at, addr) in state.history.iter().rev() {
            if servers.len() >= limit {
                break;
            }
            if before.is_some_and(|before| *updated_at >= before) {
                continue;
            }
            if after.is_some_and(|after| *updated_at <= after) {
                break;
            }
            let Some(rec) = state.records.get(addr) else {
                continue;
            };
            if fs.matches_status(rec.server.discovery_status)
                && fs.matches_active(rec.server.refreshed_at)
            {
                servers.push(rec.server.clone());
            }
        }
        Ok(servers)
    }

    async fn count(&self) -> Result<usize, RepoError> {
        Ok(self.state.read().await.records.len())
    }

    async fn count_by_status(&self) -> Result<HashMap<DiscoveryStatus, usize>, RepoError> {
        let state = self.state.read().await;
        let mut counts: HashMap<DiscoveryStatus, usize> = DiscoveryStatus::FLAGS
            .iter()
            .map(|(flag, _)| (*flag, 0))
            .collect();
        for rec in state.records.values() {
            for flag in rec.server.discovery_status.iter() {
                *counts.entry(flag).or_default() += 1;
            }
        }
        Ok(counts)
    }
}
