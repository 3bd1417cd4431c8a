use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::addr::{Addr, InstanceId};
use crate::clock::SharedClock;
use crate::error::RepoError;
use crate::filterset::InstanceFilterSet;
use crate::instance::Instance;
use crate::repository::InstanceRepository;

#[derive(Default)]
struct State {
    by_id: HashMap<InstanceId, (Instance, DateTime<Utc>)>,
    by_addr: HashMap<Addr, InstanceId>,
}

impl State {
    fn unlink(&mut self, id: &InstanceId) {
        if let Some((old, _)) = self.by_id.remove(id) {
            if self.by_addr.get(&old.addr) == Some(id) {
                self.by_addr.remove(&old.addr);
            }
        }
    }
}

pub struct InstanceMemoryRepo {
    clock: SharedClock,
    state: RwLock<State>,
}

impl InstanceMemoryRepo {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            state: RwLock::new(State::default()),
        }
    }
}

#[async_trait]
impl InstanceRepository for InstanceMemoryRepo {
    async fn add(&self, instance: Instance) -> Result<Instance, RepoError> {
        let now = self.clock.now();
        let mut state = self.state.write().await;
        if let Some(previous) = state.by_addr.get(&instance.addr).cloned() {
            if previous != instance.id {
                state.unlink(&previous);
            }
        }
        state.unlink(&instance.id);
        state.by_addr.insert(instance.addr, instance.id.clone());
        state
            .by_id
            .insert(instance.id.clone(), (instance.clone(), now));
        Ok(instance)
    }

    async fn get(&self, id: &InstanceId) -> Result<Instance, RepoError> {
        let state = self.state.read().await;
        state
            .by_id
            .get(id)
            .map(|(instance, _)| instance.clone())
            .ok_or(RepoError::NotFound)
    }

    async fn get_by_addr(&self, addr: &Addr) -> Result<Instance, RepoError> {
        let state = self.state.read().await;
        state
            .by_addr
            .get(addr)
            .and_then(|id| state.by_id.get(id))
            .map(|(instance, _)| instance.clone())
            .ok_or(RepoError::NotFound)
    }

    async fn remove(&self, id: &InstanceId) -> Result<(), RepoError> {
        self.state.write().await.unlink(id);
        Ok(())
    }

    async fn clear(&self, fs: &InstanceFilterSet) -> Result<usize, RepoError> {
        let mut state = self.state.write().await;
        let stale: Vec<InstanceId> = state
            .by_id
            .iter()
            .filter(|(_, (_, updated_at))| fs.matches_updated(*updated_at))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            state.unlink(id);
        }
        Ok(stale.len())
    }

    async fn count(&self) -> Result<usize, RepoError> {
        Ok(self.state.read().await.by_id.len())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;

    use super::*;
    use crate::clock::{Clock, ManualClock};

    fn instance(id: &[u8], addr: &str) -> Instance {
        Instance::new(InstanceId::new(id.to_vec()).unwrap(), addr.parse().unwrap())
    }

    #[tokio::test]
    async fn new_id_supersedes_old_binding() {
        let repo = InstanceMemoryRepo::new(Arc::new(ManualClock::default()));
        let old = instance(b"\x01\x02\x03\x04", "1.1.1.1:10480");
        let new = instance(b"\x05\x06\x07\x08", "1.1.1.1:10480");
        repo.add(old.clone()).await.unwrap();
        repo.add(new.clone()).await.unwrap();

        assert!(matches!(repo.get(&old.id).await, Err(RepoError::NotFound)));
        assert_eq!(repo.get_by_addr(&new.addr).await.unwrap(), new);
        assert_eq!(repo.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn clear_removes_stale_only() {
        let clock = Arc::new(ManualClock::default());
        let repo = InstanceMemoryRepo::new(clock.clone());
        repo.add(instance(b"old", "1.1.1.1:10480")).await.unwrap();
        clock.advance(Duration::seconds(10));
        let fresh = instance(b"new", "2.2.2.2:10480");
        repo.add(fresh.clone()).await.unwrap();

        let removed = repo
            .clear(&InstanceFilterSet::new().updated_before(clock.now() - Duration::seconds(5)))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(repo.get(&fresh.id).await.unwrap(), fresh);
        assert!(repo.get_by_addr(&"1.1.1.1:10480".parse().unwrap()).await.is_err());
    }
}
