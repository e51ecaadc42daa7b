//! External metadata store interface.
//!
//! The controller persists the worker list and reads process-class
//! configuration through the cluster's own transactional store, accessed
//! here behind the [`MetaStore`] trait. Only the elected controller writes
//! these ranges; any client may read them. The in-memory implementation
//! backs tests and single-process development runs.

use crate::error::{KeystoneError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::warn;

/// Key schema for controller-owned state.
///
/// Writers that change a `process_class/` entry must also touch
/// [`keys::PROCESS_CLASS_CHANGE`]; the controller watches that single key
/// rather than the whole range.
pub mod keys {
    use crate::types::ProcessId;

    pub const WORKER_LIST_PREFIX: &str = "worker_list/";
    pub const PROCESS_CLASS_PREFIX: &str = "process_class/";
    pub const PROCESS_CLASS_LEGACY_PREFIX: &str = "process_class_old/";
    pub const PROCESS_CLASS_VERSION: &str = "process_class_version";
    pub const PROCESS_CLASS_CHANGE: &str = "process_class_change";
    pub const CLIENT_TXN_SAMPLE_RATE: &str = "client_txn_sample_rate";
    pub const CLIENT_TXN_SIZE_LIMIT: &str = "client_txn_size_limit";

    /// Current schema version written by the one-time key migration.
    pub const PROCESS_CLASS_SCHEMA: &str = "1";

    pub fn worker_list(process: &ProcessId) -> String {
        format!("{}{}", WORKER_LIST_PREFIX, process)
    }

    pub fn process_class(process: &ProcessId) -> String {
        format!("{}{}", PROCESS_CLASS_PREFIX, process)
    }
}

/// A single store mutation. Batches passed to [`MetaStore::apply`] commit
/// atomically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Set(String, Vec<u8>),
    Clear(String),
    ClearRange(String),
}

/// The external transactional store, reduced to the operations the
/// controller needs.
#[async_trait]
pub trait MetaStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// All key/value pairs with the given prefix, in key order.
    async fn get_range(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Atomically apply a batch of mutations.
    async fn apply(&self, mutations: Vec<Mutation>) -> Result<()>;

    /// Complete when the key next changes (set or cleared) after this call.
    async fn watch(&self, key: &str) -> Result<()>;
}

/// Retry a store operation on transient errors with capped backoff.
/// Non-retryable errors surface immediately.
pub async fn with_retry<T, F, Fut>(operation: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut backoff = Duration::from_millis(10);
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() => {
                warn!(operation, error = %e, backoff_ms = backoff.as_millis() as u64, "Store operation failed, retrying");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(1));
            }
            Err(e) => return Err(e),
        }
    }
}

/// In-memory [`MetaStore`] for tests and development.
pub struct MemoryStore {
    data: RwLock<BTreeMap<String, Vec<u8>>>,
    watchers: RwLock<HashMap<String, watch::Sender<u64>>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            data: RwLock::new(BTreeMap::new()),
            watchers: RwLock::new(HashMap::new()),
        })
    }

    async fn notify(&self, key: &str) {
        let watchers = self.watchers.read().await;
        if let Some(tx) = watchers.get(key) {
            tx.send_modify(|v| *v += 1);
        }
    }
}

#[async_trait]
impl MetaStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.data.read().await.get(key).cloned())
    }

    async fn get_range(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let data = self.data.read().await;
        Ok(data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn apply(&self, mutations: Vec<Mutation>) -> Result<()> {
        let mut touched = Vec::new();
        {
            let mut data = self.data.write().await;
            for m in mutations {
                match m {
                    Mutation::Set(k, v) => {
                        data.insert(k.clone(), v);
                        touched.push(k);
                    }
                    Mutation::Clear(k) => {
                        data.remove(&k);
                        touched.push(k);
                    }
                    Mutation::ClearRange(prefix) => {
                        let keys: Vec<String> = data
                            .range(prefix.clone()..)
                            .take_while(|(k, _)| k.starts_with(&prefix))
                            .map(|(k, _)| k.clone())
                            .collect();
                        for k in keys {
                            data.remove(&k);
                            touched.push(k);
                        }
                    }
                }
            }
        }
        for k in touched {
            self.notify(&k).await;
        }
        Ok(())
    }

    async fn watch(&self, key: &str) -> Result<()> {
        let mut rx = {
            let mut watchers = self.watchers.write().await;
            watchers
                .entry(key.to_string())
                .or_insert_with(|| watch::channel(0u64).0)
                .subscribe()
        };
        rx.changed()
            .await
            .map_err(|_| KeystoneError::Store("watch channel closed".to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_set_clear() {
        let store = MemoryStore::new();
        store
            .apply(vec![Mutation::Set("a".into(), b"1".to_vec())])
            .await
            .unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(b"1".to_vec()));

        store.apply(vec![Mutation::Clear("a".into())]).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_get_range_respects_prefix() {
        let store = MemoryStore::new();
        store
            .apply(vec![
                Mutation::Set("worker_list/p1".into(), b"1".to_vec()),
                Mutation::Set("worker_list/p2".into(), b"2".to_vec()),
                Mutation::Set("other/p3".into(), b"3".to_vec()),
            ])
            .await
            .unwrap();

        let range = store.get_range(keys::WORKER_LIST_PREFIX).await.unwrap();
        assert_eq!(range.len(), 2);
        assert_eq!(range[0].0, "worker_list/p1");
    }

    #[tokio::test]
    async fn test_clear_range() {
        let store = MemoryStore::new();
        store
            .apply(vec![
                Mutation::Set("worker_list/p1".into(), b"1".to_vec()),
                Mutation::Set("worker_list/p2".into(), b"2".to_vec()),
                Mutation::Set("other".into(), b"3".to_vec()),
            ])
            .await
            .unwrap();

        store
            .apply(vec![Mutation::ClearRange(keys::WORKER_LIST_PREFIX.into())])
            .await
            .unwrap();

        assert!(store.get_range(keys::WORKER_LIST_PREFIX).await.unwrap().is_empty());
        assert!(store.get("other").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_watch_fires_on_change() {
        let store = MemoryStore::new();
        let watcher = {
            let store = store.clone();
            tokio::spawn(async move { store.watch("k").await })
        };

        // Give the watcher a chance to install itself.
        tokio::time::sleep(Duration::from_millis(20)).await;
        store
            .apply(vec![Mutation::Set("k".into(), b"v".to_vec())])
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), watcher)
            .await
            .expect("watch should fire")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_with_retry_surfaces_permanent_errors() {
        let result: Result<()> = with_retry("op", || async {
            Err(KeystoneError::Internal("boom".into()))
        })
        .await;
        assert!(result.is_err());
    }
}
