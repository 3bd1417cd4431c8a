//! Repository contracts.
//!
//! Both backends implement the same optimistic-concurrency protocol:
//!
//! * `add` stores a new record at version 1. If one already exists the
//!   conflict callback decides: `false` fails with [`RepoError::AlreadyExists`],
//!   `true` persists the record as the callback left it.
//! * `update` fails with [`RepoError::NotFound`] when there is no record. When
//!   the stored version is newer than the caller's copy the callback decides:
//!   `false` returns the stored server untouched, `true` persists the resolved
//!   copy.
//! * `remove` applies the same staleness check as `update`. Removing an absent
//!   record is a no-op.
//!
//! Every accepted write advances `version` by exactly one and stamps the
//! record's last-updated time. `refreshed_at` is left as the caller set it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::addr::{Addr, InstanceId};
use crate::error::RepoError;
use crate::filterset::{InstanceFilterSet, ServerFilterSet};
use crate::instance::Instance;
use crate::probe::Probe;
use crate::server::Server;
use crate::status::DiscoveryStatus;

pub mod memory;
pub mod shared;

/// Conflict resolution callback. Receives the authoritative stored copy and
/// may mutate it in place into the state that should be persisted.
pub type OnConflict<'a> = dyn Fn(&mut Server) -> bool + Send + Sync + 'a;

/// Declines every conflict.
pub fn decline(_: &mut Server) -> bool {
    false
}

#[async_trait]
pub trait ServerRepository: Send + Sync {
    async fn get(&self, addr: &Addr) -> Result<Server, RepoError>;
    async fn add(&self, server: Server, on_conflict: &OnConflict<'_>) -> Result<Server, RepoError>;
    async fn update(
        &self,
        server: Server,
        on_conflict: &OnConflict<'_>,
    ) -> Result<Server, RepoError>;
    async fn remove(&self, server: &Server, on_conflict: &OnConflict<'_>) -> Result<(), RepoError>;
    /// Matching servers, most recently updated first.
    async fn filter(&self, fs: &ServerFilterSet) -> Result<Vec<Server>, RepoError>;
    async fn count(&self) -> Result<usize, RepoError>;
    /// Number of servers carrying each named status bit.
    async fn count_by_status(&self) -> Result<HashMap<DiscoveryStatus, usize>, RepoError>;
}

/// Time-windowed probe queue.
#[async_trait]
pub trait ProbeRepository: Send + Sync {
    async fn add(&self, probe: Probe) -> Result<(), RepoError>;
    /// Enqueues `probe` to become visible at `not_before` and to be dropped at
    /// `expires_at`. An empty window is silently ignored.
    async fn add_between(
        &self,
        probe: Probe,
        not_before: Option<DateTime<Utc>>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), RepoError>;
    /// Next ready probe, or [`RepoError::QueueEmpty`].
    async fn pop(&self) -> Result<Probe, RepoError>;
    /// Up to `count` ready probes in readiness order, plus the number of
    /// expired items discarded on the way. Never waits.
    async fn pop_many(&self, count: usize) -> Result<(Vec<Probe>, usize), RepoError>;
    async fn count(&self) -> Result<usize, RepoError>;
}

#[async_trait]
pub trait InstanceRepository: Send + Sync {
    /// Stores `instance`, superseding any other id bound to the same address.
    async fn add(&self, instance: Instance) -> Result<Instance, RepoError>;
    async fn get(&self, id: &InstanceId) -> Result<Instance, RepoError>;
    async fn get_by_addr(&self, addr: &Addr) -> Result<Instance, RepoError>;
    async fn remove(&self, id: &InstanceId) -> Result<(), RepoError>;
    /// Removes matching instances and returns how many went away.
    async fn clear(&self, fs: &InstanceFilterSet) -> Result<usize, RepoError>;
    async fn count(&self) -> Result<usize, RepoError>;
}

/// The three repositories a service instance works against.
#[derive(Clone)]
pub struct Repositories {
    pub servers: Arc<dyn ServerRepository>,
    pub probes: Arc<dyn ProbeRepository>,
    pub instances: Arc<dyn InstanceRepository>,
}

/// Empty window check shared by both queue backends.
pub(crate) fn window_is_empty(
    not_before: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
) -> bool {
    matches!((not_before, expires_at), (Some(nb), Some(exp)) if nb >= exp)
}
