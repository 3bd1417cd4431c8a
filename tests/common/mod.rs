//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use mastersrv::clock::ManualClock;
use mastersrv::repository::shared::{self, Keyspace, LockManager, MemoryKv};
use mastersrv::repository::{memory, Repositories};
use mastersrv::server::Server;
use mastersrv::status::DiscoveryStatus;

pub struct Backend {
    pub name: &'static str,
    pub clock: Arc<ManualClock>,
    pub repos: Repositories,
}

pub fn memory_backend() -> Backend {
    let clock = Arc::new(ManualClock::default());
    Backend {
        name: "memory",
        repos: memory::repositories(clock.clone()),
        clock,
    }
}

/// The shared backend over the in-process store, with enough lock attempts
/// for the contention tests.
pub fn shared_backend() -> Backend {
    let clock = Arc::new(ManualClock::default());
    let kv = Arc::new(MemoryKv::new(clock.clone()));
    let locks = LockManager::new(kv.clone()).with_attempts(64);
    Backend {
        name: "shared",
        repos: shared::repositories(kv, Keyspace::new("/test"), locks, clock.clone()),
        clock,
    }
}

pub fn backends() -> Vec<Backend> {
    vec![memory_backend(), shared_backend()]
}

pub fn server(addr: &str, status: DiscoveryStatus) -> Server {
    let mut svr = Server::new(addr.parse().unwrap(), 10481);
    svr.update_discovery_status(status);
    svr
}

/// Polls `check` until it holds, failing the test after five seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
