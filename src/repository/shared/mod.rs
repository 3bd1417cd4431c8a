//! Backend shared by several service instances through a networked
//! key/value store.
//!
//! Layout under the configured prefix:
//!
//! | key | value |
//! |---|---|
//! | `servers/<addr>` | JSON server record with its last-updated time |
//! | `updated/<ts>/<addr>` | ordered index on last update |
//! | `refreshed/<ts>/<addr>` | ordered index on last liveness signal |
//! | `status/<flag>/<addr>` | one membership set per status bit |
//! | `probes/<ts>/<uuid>` | queued probe, ordered by readiness |
//! | `instances/<hex id>` | JSON instance record |
//! | `bindings/<addr>` | hex id currently bound to the address |
//! | `locks/<kind>/<addr>` | per-address write lock |
//!
//! Timestamps are zero-padded microseconds so lexical order is time order.
//! Reads go straight to the store and may see a slightly stale snapshot;
//! writes to one address are serialised by the [`LockManager`].

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::addr::{Addr, InstanceId};
use crate::clock::SharedClock;
use crate::error::StoreError;

use super::Repositories;

mod etcd;
mod instances;
pub mod kv;
pub mod lock;
mod memkv;
mod probes;
mod servers;

pub use etcd::EtcdStore;
pub use instances::InstanceSharedRepo;
pub use kv::{KvCompare, KvEntry, KvOp, KvStore};
pub use lock::{LockManager, Staged};
pub use memkv::MemoryKv;
pub use probes::ProbeSharedRepo;
pub use servers::ServerSharedRepo;

#[derive(Debug, Clone)]
pub struct Keyspace {
    prefix: String,
}

impl Keyspace {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn servers(&self) -> String {
        format!("{}/servers/", self.prefix)
    }

    pub fn server(&self, addr: &Addr) -> String {
        format!("{}/servers/{}", self.prefix, addr)
    }

    pub fn updated(&self) -> String {
        format!("{}/updated/", self.prefix)
    }

    pub fn refreshed(&self) -> String {
        format!("{}/refreshed/", self.prefix)
    }

    pub fn status(&self, flag: &str) -> String {
        format!("{}/status/{}/", self.prefix, flag)
    }

    pub fn server_lock(&self, addr: &Addr) -> String {
        format!("{}/locks/servers/{}", self.prefix, addr)
    }

    pub fn probes(&self) -> String {
        format!("{}/probes/", self.prefix)
    }

    pub fn instances(&self) -> String {
        format!("{}/instances/", self.prefix)
    }

    pub fn instance(&self, id: &InstanceId) -> String {
        format!("{}/instances/{}", self.prefix, id.to_hex())
    }

    pub fn binding(&self, addr: &Addr) -> String {
        format!("{}/bindings/{}", self.prefix, addr)
    }

    pub fn instance_lock(&self, addr: &Addr) -> String {
        format!("{}/locks/instances/{}", self.prefix, addr)
    }
}

impl Default for Keyspace {
    fn default() -> Self {
        Self::new("/mastersrv")
    }
}

pub(crate) fn ts(at: DateTime<Utc>) -> String {
    format!("{:020}", at.timestamp_micros().max(0))
}

/// Key bounds covering `after <= ts <= before` inside a `<prefix><ts>/...`
/// index. Keys only hold whole microseconds, so callers recheck the exact
/// bounds against the record.
pub(crate) fn time_range(
    prefix: &str,
    after: Option<DateTime<Utc>>,
    before: Option<DateTime<Utc>>,
) -> (String, String) {
    let start = match after {
        Some(after) => format!("{}{}/", prefix, ts(after)),
        None => prefix.to_string(),
    };
    let end = match before {
        Some(before) => format!("{}{}/", prefix, ts(before + Duration::microseconds(1))),
        None => kv::prefix_end(prefix),
    };
    (start, end)
}

/// Splits `<prefix><ts>/<rest>` into its timestamp and trailing segment.
pub(crate) fn split_time_key<'a>(prefix: &str, key: &'a str) -> Result<(i64, &'a str), StoreError> {
    key.strip_prefix(prefix)
        .and_then(|rest| rest.split_once('/'))
        .and_then(|(micros, rest)| micros.parse().ok().map(|micros| (micros, rest)))
        .ok_or_else(|| StoreError::MalformedKey(key.to_string()))
}

/// Every repository backed by one store. Writes share one lock manager.
pub fn repositories(
    store: Arc<dyn KvStore>,
    keys: Keyspace,
    locks: LockManager,
    clock: SharedClock,
) -> Repositories {
    Repositories {
        servers: Arc::new(ServerSharedRepo::new(
            store.clone(),
            keys.clone(),
            locks.clone(),
            clock.clone(),
        )),
        probes: Arc::new(ProbeSharedRepo::new(store.clone(), keys.clone(), clock.clone())),
        instances: Arc::new(InstanceSharedRepo::new(store, keys, locks, clock)),
    }
}
