//! Shared repositories against a live etcd. Run with
//! `MASTERSRV_TEST_ETCD=http://127.0.0.1:2379 cargo test -- --ignored`.

mod common;

use std::sync::Arc;
use std::time::Duration;

use mastersrv::clock;
use mastersrv::error::RepoError;
use mastersrv::probe::{Goal, Probe};
use mastersrv::repository::shared::{self, EtcdStore, Keyspace, LockManager};
use mastersrv::repository::{decline, Repositories};
use mastersrv::server::Server;
use mastersrv::status::DiscoveryStatus;
use uuid::Uuid;

use common::server;

async fn connect() -> Repositories {
    let endpoint = std::env::var("MASTERSRV_TEST_ETCD")
        .unwrap_or_else(|_| "http://127.0.0.1:2379".into());
    let store = Arc::new(
        EtcdStore::connect(vec![endpoint], Duration::from_secs(5))
            .await
            .unwrap(),
    );
    // fresh prefix per run
    let keys = Keyspace::new(format!("/mastersrv-test/{}", Uuid::new_v4().simple()));
    let locks = LockManager::new(store.clone());
    shared::repositories(store, keys, locks, clock::system())
}

#[tokio::test]
#[ignore]
async fn server_round_trip() {
    let repos = connect().await;
    let added = repos
        .servers
        .add(server("1.1.1.1:10480", DiscoveryStatus::MASTER), &decline)
        .await
        .unwrap();
    assert_eq!(added.version, 1);

    let mut next = added.clone();
    next.update_discovery_status(DiscoveryStatus::PORT);
    let updated = repos.servers.update(next, &decline).await.unwrap();
    assert_eq!(updated.version, 2);

    let stale = repos.servers.update(added.clone(), &decline).await.unwrap();
    assert_eq!(stale, updated);

    let resolved = repos
        .servers
        .update(added.clone(), &|stored: &mut Server| {
            stored.update_discovery_status(DiscoveryStatus::INFO);
            true
        })
        .await
        .unwrap();
    assert_eq!(resolved.version, 3);

    let counts = repos.servers.count_by_status().await.unwrap();
    assert_eq!(counts[&DiscoveryStatus::INFO], 1);

    repos.servers.remove(&resolved, &decline).await.unwrap();
    assert!(matches!(repos.servers.get(&added.addr).await, Err(RepoError::NotFound)));
    assert_eq!(repos.servers.count().await.unwrap(), 0);
}

#[tokio::test]
#[ignore]
async fn probe_queue_round_trip() {
    let repos = connect().await;
    for n in 1..=3 {
        let addr = format!("1.1.1.{n}:10480").parse().unwrap();
        repos.probes.add(Probe::new(addr, 10481, Goal::Details, 3)).await.unwrap();
    }
    let (probes, expired) = repos.probes.pop_many(2).await.unwrap();
    assert_eq!(probes.len(), 2);
    assert_eq!(expired, 0);
    assert_eq!(repos.probes.count().await.unwrap(), 1);
    repos.probes.pop().await.unwrap();
    assert!(matches!(repos.probes.pop().await, Err(RepoError::QueueEmpty)));
}
