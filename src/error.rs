//! Error taxonomy shared by the repositories, the lock manager and the probers.
//!
//! Conflicts and an empty queue are ordinary outcomes handled by the immediate
//! caller. Backend errors wrap the transport error and are surfaced as-is.

use std::net::Ipv4Addr;

use thiserror::Error;

/// Malformed address, port or identity token. Rejected at the boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddrError {
    #[error("invalid port {0}")]
    InvalidPort(u16),
    #[error("address {0} is not publicly routable")]
    NotPublic(Ipv4Addr),
    #[error("malformed address {0:?}")]
    Malformed(String),
    #[error("instance id must be 1..=16 bytes, got {0}")]
    InstanceIdLength(usize),
}

/// Errors raised by the key/value store underneath the shared backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("etcd: {0}")]
    Etcd(#[from] etcd_client::Error),
    #[error("lease {0} not found")]
    LeaseNotFound(i64),
    #[error("malformed key {0:?}")]
    MalformedKey(String),
}

#[derive(Debug, Error)]
pub enum LockError {
    /// Held by someone else, or ownership was lost before the writes landed.
    #[error("lock {0} not acquired")]
    NotAcquired(String),
    #[error("lock {key} not acquired after {attempts} attempts")]
    Exhausted { key: String, attempts: usize },
}

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("queue is empty")]
    QueueEmpty,
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("record codec: {0}")]
    Codec(#[from] serde_json::Error),
    #[error(transparent)]
    Invalid(#[from] AddrError),
}

impl RepoError {
    /// True for lock contention that a retry may resolve.
    pub fn is_contention(&self) -> bool {
        matches!(self, RepoError::Lock(LockError::NotAcquired(_)))
    }
}

/// Failures while querying a remote game server.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out")]
    Timeout,
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("server reports port {reported}, expected {expected}")]
    PortMismatch { expected: u16, reported: u16 },
    #[error("no candidate port answered")]
    NoCandidates,
    #[error("unexpected result for goal {0}")]
    WrongResult(&'static str),
}
