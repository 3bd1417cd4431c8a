//! Narrow key/value store interface the shared backend is written against.
//!
//! It mirrors the subset of etcd the backend needs: point reads, ordered range
//! scans, conditional multi-key transactions and leases. Keys are ASCII.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub mod_revision: i64,
}

/// Guard evaluated at the start of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvCompare {
    /// Key exists and holds exactly this value.
    Value(String, Vec<u8>),
    /// Key does not exist.
    Absent(String),
    /// Key was last written at this revision.
    ModRevision(String, i64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvOp {
    Put {
        key: String,
        value: Vec<u8>,
        lease: Option<i64>,
    },
    Delete {
        key: String,
    },
}

impl KvOp {
    pub fn put(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        KvOp::Put {
            key: key.into(),
            value: value.into(),
            lease: None,
        }
    }

    pub fn put_with_lease(key: impl Into<String>, value: impl Into<Vec<u8>>, lease: i64) -> Self {
        KvOp::Put {
            key: key.into(),
            value: value.into(),
            lease: Some(lease),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        KvOp::Delete { key: key.into() }
    }

    pub fn key(&self) -> &str {
        match self {
            KvOp::Put { key, .. } | KvOp::Delete { key } => key,
        }
    }
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, StoreError>;
    /// Entries with `start <= key < end` in key order.
    async fn range(
        &self,
        start: &str,
        end: &str,
        limit: Option<usize>,
    ) -> Result<Vec<KvEntry>, StoreError>;
    async fn count(&self, start: &str, end: &str) -> Result<usize, StoreError>;
    /// Applies `ops` atomically if every compare holds. Returns whether it did.
    async fn txn(&self, compares: Vec<KvCompare>, ops: Vec<KvOp>) -> Result<bool, StoreError>;
    async fn grant_lease(&self, ttl: Duration) -> Result<i64, StoreError>;
    async fn revoke_lease(&self, lease: i64) -> Result<(), StoreError>;
}

/// Smallest key greater than every key starting with `prefix`.
pub fn prefix_end(prefix: &str) -> String {
    let mut bytes = prefix.as_bytes().to_vec();
    while let Some(last) = bytes.pop() {
        if last < 0x7f {
            bytes.push(last + 1);
            return String::from_utf8_lossy(&bytes).into_owned();
        }
    }
    // all 0x7f: no upper bound representable in ASCII
    "\u{7f}".repeat(prefix.len() + 1)
}

/// Lease lifetimes are whole seconds, never below one.
pub fn lease_secs(ttl: Duration) -> i64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_end_bumps_last_byte() {
        assert_eq!(prefix_end("/srv/servers/"), "/srv/servers0");
        assert_eq!(prefix_end("a"), "b");
    }

    #[test]
    fn lease_rounds_up() {
        assert_eq!(lease_secs(Duration::from_millis(1)), 1);
        assert_eq!(lease_secs(Duration::from_millis(1500)), 2);
        assert_eq!(lease_secs(Duration::from_secs(5)), 5);
        assert_eq!(lease_secs(Duration::ZERO), 1);
    }
}
