//! etcd adapter for [`KvStore`].

use std::time::Duration;

use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use etcd_client::{Client, Compare, CompareOp, GetOptions, KeyValue, PutOptions, Txn, TxnOp};
use log::{debug, warn};

use super::kv::{lease_secs, KvCompare, KvEntry, KvOp, KvStore};
use crate::error::StoreError;

#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    /// Connect with exponential backoff, giving up after `max_elapsed`.
    pub async fn connect(
        endpoints: Vec<String>,
        max_elapsed: Duration,
    ) -> Result<Self, StoreError> {
        let backoff = ExponentialBackoff {
            max_elapsed_time: Some(max_elapsed),
            ..Default::default()
        };

        let client = retry(backoff, || async {
            match Client::connect(&endpoints, None).await {
                Ok(client) => {
                    debug!("Connected to etcd at {:?}", endpoints);
                    Ok(client)
                }
                Err(e) => {
                    warn!("etcd connection failed, retrying: {}", e);
                    Err(backoff::Error::transient(e))
                }
            }
        })
        .await?;

        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

fn entry(kv: &KeyValue) -> KvEntry {
    KvEntry {
        key: String::from_utf8_lossy(kv.key()).into_owned(),
        value: kv.value().to_vec(),
        mod_revision: kv.mod_revision(),
    }
}

#[async_trait]
impl KvStore for EtcdStore {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, StoreError> {
        let mut kv = self.client.kv_client();
        let resp = kv.get(key, None).await?;
        Ok(resp.kvs().first().map(entry))
    }

    async fn range(
        &self,
        start: &str,
        end: &str,
        limit: Option<usize>,
    ) -> Result<Vec<KvEntry>, StoreError> {
        let mut kv = self.client.kv_client();
        let mut options = GetOptions::new().with_range(end);
        if let Some(limit) = limit {
            options = options.with_limit(limit as i64);
        }
        let resp = kv.get(start, Some(options)).await?;
        Ok(resp.kvs().iter().map(entry).collect())
    }

    async fn count(&self, start: &str, end: &str) -> Result<usize, StoreError> {
        let mut kv = self.client.kv_client();
        let options = GetOptions::new().with_range(end).with_count_only();
        let resp = kv.get(start, Some(options)).await?;
        Ok(resp.count().max(0) as usize)
    }

    async fn txn(&self, compares: Vec<KvCompare>, ops: Vec<KvOp>) -> Result<bool, StoreError> {
        let compares: Vec<Compare> = compares
            .into_iter()
            .map(|cmp| match cmp {
                KvCompare::Value(key, value) => Compare::value(key, CompareOp::Equal, value),
                KvCompare::Absent(key) => Compare::create_revision(key, CompareOp::Equal, 0),
                KvCompare::ModRevision(key, rev) => {
                    Compare::mod_revision(key, CompareOp::Equal, rev)
                }
            })
            .collect();
        let ops: Vec<TxnOp> = ops
            .into_iter()
            .map(|op| match op {
                KvOp::Put { key, value, lease } => {
                    TxnOp::put(key, value, lease.map(|id| PutOptions::new().with_lease(id)))
                }
                KvOp::Delete { key } => TxnOp::delete(key, None),
            })
            .collect();

        let mut kv = self.client.kv_client();
        let resp = kv.txn(Txn::new().when(compares).and_then(ops)).await?;
        Ok(resp.succeeded())
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<i64, StoreError> {
        let mut lease = self.client.lease_client();
        let resp = lease.grant(lease_secs(ttl), None).await?;
        Ok(resp.id())
    }

    async fn revoke_lease(&self, lease: i64) -> Result<(), StoreError> {
        let mut client = self.client.lease_client();
        client.revoke(lease).await?;
        Ok(())
    }
}
