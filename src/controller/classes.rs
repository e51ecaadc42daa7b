//! Process-class reconciliation against the external store.
//!
//! The store's `process_class/` range is the source of truth for
//! database-configured classes. A one-time migration rewrites legacy keys
//! under the new schema before the watch loop starts. On every change the
//! full range is re-read, the class map rebuilt, and each worker's
//! effective class re-derived; outstanding requests are then retried
//! since a class change can unblock placement.

use super::{intake, ClusterState};
use crate::error::Result;
use crate::store::{self, keys, MetaStore, Mutation};
use crate::types::{ClassSource, ProcessClass, ProcessId};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub(crate) async fn monitor_process_classes(
    state: Arc<ClusterState>,
    metastore: Arc<dyn MetaStore>,
) -> Result<()> {
    upgrade_process_class_schema(&metastore).await?;

    let mut shutdown = state.shutdown.subscribe();
    let mut last: Option<Vec<(String, Vec<u8>)>> = None;

    loop {
        let entries = store::with_retry("read_process_classes", || {
            metastore.get_range(keys::PROCESS_CLASS_PREFIX)
        })
        .await?;

        if last.as_ref() != Some(&entries) || !state.got_process_classes() {
            let mut classes: HashMap<ProcessId, ProcessClass> = HashMap::new();
            for (key, value) in &entries {
                let process = ProcessId::new(key.trim_start_matches(keys::PROCESS_CLASS_PREFIX));
                let class: ProcessClass = match serde_json::from_slice(value) {
                    Ok(class) => class,
                    Err(e) => {
                        warn!(%process, error = %e, "Skipping undecodable process class");
                        continue;
                    }
                };
                // Command-line classes never come from the store; an entry
                // claiming otherwise is corrupt.
                if class.class_source == ClassSource::CommandLine {
                    warn!(%process, "Skipping store class with command-line source");
                    continue;
                }
                classes.insert(process, class);
            }

            debug!(count = classes.len(), "Applying process classes from store");
            state.apply_process_classes(classes).await;
            state.got_process_classes.store(true, Ordering::SeqCst);
            last = Some(entries);
            intake::check_outstanding_requests(&state).await;
        }

        tokio::select! {
            watched = metastore.watch(keys::PROCESS_CLASS_CHANGE) => { watched?; }
            _ = shutdown.recv() => return Ok(()),
        }
    }
}

/// One-time migration of legacy process-class keys, gated on the schema
/// version key so it runs exactly once per cluster.
async fn upgrade_process_class_schema(metastore: &Arc<dyn MetaStore>) -> Result<()> {
    store::with_retry("upgrade_process_class_schema", || async {
        if metastore.get(keys::PROCESS_CLASS_VERSION).await?.is_some() {
            return Ok(());
        }

        let legacy = metastore
            .get_range(keys::PROCESS_CLASS_LEGACY_PREFIX)
            .await?;

        let mut mutations = Vec::with_capacity(legacy.len() + 2);
        for (key, value) in &legacy {
            let process = key.trim_start_matches(keys::PROCESS_CLASS_LEGACY_PREFIX);
            mutations.push(Mutation::Set(
                format!("{}{}", keys::PROCESS_CLASS_PREFIX, process),
                value.clone(),
            ));
        }
        mutations.push(Mutation::ClearRange(
            keys::PROCESS_CLASS_LEGACY_PREFIX.to_string(),
        ));
        mutations.push(Mutation::Set(
            keys::PROCESS_CLASS_VERSION.to_string(),
            keys::PROCESS_CLASS_SCHEMA.as_bytes().to_vec(),
        ));
        metastore.apply(mutations).await?;

        info!(migrated = legacy.len(), "Process class keys migrated to current schema");
        Ok(())
    })
    .await
}

/// Watch the client transaction sampling configuration keys and publish
/// client snapshot updates when they change.
pub(crate) async fn monitor_client_txn_config(
    state: Arc<ClusterState>,
    metastore: Arc<dyn MetaStore>,
) -> Result<()> {
    let mut shutdown = state.shutdown.subscribe();

    loop {
        let sample_rate = store::with_retry("read_txn_sample_rate", || {
            metastore.get(keys::CLIENT_TXN_SAMPLE_RATE)
        })
        .await?
        .and_then(|value| serde_json::from_slice::<f64>(&value).ok());

        let size_limit = store::with_retry("read_txn_size_limit", || {
            metastore.get(keys::CLIENT_TXN_SIZE_LIMIT)
        })
        .await?
        .and_then(|value| serde_json::from_slice::<i64>(&value).ok());

        let current = state.client_info.get();
        if (sample_rate.is_some() && sample_rate != current.txn_sample_rate)
            || (size_limit.is_some() && size_limit != current.txn_size_limit)
        {
            debug!(?sample_rate, ?size_limit, "Client transaction config changed");
            state.client_info.publish_with(|client| {
                if sample_rate.is_some() {
                    client.txn_sample_rate = sample_rate;
                }
                if size_limit.is_some() {
                    client.txn_size_limit = size_limit;
                }
            });
        }

        tokio::select! {
            watched = metastore.watch(keys::CLIENT_TXN_SAMPLE_RATE) => { watched?; }
            watched = metastore.watch(keys::CLIENT_TXN_SIZE_LIMIT) => { watched?; }
            _ = shutdown.recv() => return Ok(()),
        }
    }
}
