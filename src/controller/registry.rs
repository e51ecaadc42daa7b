//! Worker registry: lease-like registration plus availability watching.
//!
//! Each registered process has exactly one [`WorkerInfo`]. Registration
//! holds the worker's reply channel open as a stand-down lease; resolving
//! it tells the worker its registration has been superseded or revoked.
//! A per-worker watcher subscribes to the availability view and evicts
//! workers that stay unreachable, debouncing reboots so a restarting
//! worker is not immediately trusted with the master role.

use super::{intake, ClusterState};
use crate::error::Result;
use crate::messages::{RegisterWorkerRequest, WorkerHandle};
use crate::shutdown::ShutdownCoordinator;
use crate::store::{self, keys, MetaStore, Mutation};
use crate::types::{ClassSource, ClassType, Generation, ProcessClass, ProcessData, ProcessId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One live worker incarnation.
pub struct WorkerInfo {
    pub worker: WorkerHandle,
    /// Class the worker advertised at registration.
    pub initial_class: ProcessClass,
    /// Effective class after reconciliation with the store.
    pub process_class: ProcessClass,
    pub generation: Generation,
    /// Recent availability transitions; >= 2 marks the worker unstable.
    pub reboots: u32,
    reply: Option<oneshot::Sender<()>>,
    watcher: JoinHandle<()>,
}

impl WorkerInfo {
    /// Resolve the stand-down lease. Safe to call more than once; only the
    /// first call sends.
    pub(crate) fn release_reply(&mut self) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(());
        }
    }

    pub(crate) fn abort_watcher(&self) {
        self.watcher.abort();
    }
}

impl ClusterState {
    /// Apply a worker registration per the registry rules:
    ///
    /// - unknown process: insert, reconcile class, start a watcher
    /// - same incarnation with an older generation: ignore as stale
    /// - new incarnation or same-or-newer generation: adopt the advertised
    ///   class where the stored source allows, release the previous lease,
    ///   and restart the watcher when the incarnation changed
    pub async fn register_worker(self: &Arc<Self>, request: RegisterWorkerRequest) {
        let process = request.worker.process_id().clone();
        let effective = {
            let id_class = self.id_class.read().await;
            reconcile_class(id_class.get(&process), request.class)
        };

        let mut workers = self.workers.write().await;
        let known = workers.contains_key(&process);

        debug!(
            controller_id = %self.id,
            process = %process,
            worker_id = %request.worker.id,
            zone = %request.worker.locality.zone,
            class = %request.class,
            generation = request.generation,
            known,
            "Worker registration"
        );

        if !known {
            let watcher =
                spawn_availability_watch(self.clone(), request.worker.clone(), request.class);
            workers.insert(
                process,
                WorkerInfo {
                    worker: request.worker,
                    initial_class: request.class,
                    process_class: effective,
                    generation: request.generation,
                    reboots: 0,
                    reply: Some(request.reply),
                    watcher,
                },
            );
            drop(workers);
            intake::check_outstanding_requests(self).await;
            return;
        }

        let info = workers.get_mut(&process).expect("presence checked above");
        // The disjunction is deliberate: a *different* incarnation is
        // accepted even with an older generation, because the generation
        // counter restarts with the process.
        if info.worker.id != request.worker.id || request.generation >= info.generation {
            let source = info.process_class.class_source;
            if source == ClassSource::CommandLine
                || (source == ClassSource::Auto && request.class.class_type != ClassType::Unset)
            {
                info.process_class = request.class;
            }
            info.initial_class = request.class;
            info.release_reply();
            info.reply = Some(request.reply);
            info.generation = request.generation;

            if info.worker.id != request.worker.id {
                info.abort_watcher();
                info.worker = request.worker.clone();
                info.watcher =
                    spawn_availability_watch(self.clone(), request.worker, request.class);
            }
        } else {
            debug!(process = %info.worker.locality.process, "Stale worker registration ignored");
        }
    }

    /// Re-run class reconciliation for every registered worker against a
    /// fresh class map from the store.
    pub(crate) async fn apply_process_classes(
        self: &Arc<Self>,
        classes: HashMap<ProcessId, ProcessClass>,
    ) {
        {
            let mut id_class = self.id_class.write().await;
            *id_class = classes;
        }
        let id_class = self.id_class.read().await;
        let mut workers = self.workers.write().await;
        for (process, info) in workers.iter_mut() {
            info.process_class = reconcile_class(id_class.get(process), info.initial_class);
        }
    }

    /// Registered generation for a process, if any. Exposed for tooling.
    pub async fn worker_generation(&self, process: &ProcessId) -> Option<Generation> {
        self.workers.read().await.get(process).map(|info| info.generation)
    }

    /// Registered incarnation for a process, if any. Exposed for tooling.
    pub async fn worker_incarnation(&self, process: &ProcessId) -> Option<crate::types::WorkerId> {
        self.workers.read().await.get(process).map(|info| info.worker.id)
    }

    /// Snapshot of registered workers and their effective classes.
    pub(crate) async fn workers_snapshot(&self) -> Vec<(WorkerHandle, ProcessClass)> {
        self.workers
            .read()
            .await
            .values()
            .map(|info| (info.worker.clone(), info.process_class))
            .collect()
    }
}

/// The effective class: the database entry wins when it is DB-sourced or
/// the worker advertised no preference; otherwise the advertised class
/// stands.
fn reconcile_class(db_class: Option<&ProcessClass>, advertised: ProcessClass) -> ProcessClass {
    match db_class {
        Some(db)
            if db.class_source == ClassSource::Db
                || advertised.class_type == ClassType::Unset =>
        {
            *db
        }
        _ => advertised,
    }
}

/// Watch one worker's availability for the lifetime of its registration.
fn spawn_availability_watch(
    state: Arc<ClusterState>,
    worker: WorkerHandle,
    starting_class: ProcessClass,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let process = worker.process_id().clone();
        let address = worker.address();
        let _ = state.worker_list.send((
            process.clone(),
            Some(ProcessData {
                locality: worker.locality.clone(),
                class: starting_class,
                address,
            }),
        ));

        let mut monitor = state.monitor();
        let mut shutdown = state.shutdown.subscribe();
        let mut was_available = monitor.is_available(address);

        loop {
            if monitor.is_available(address) {
                if !was_available {
                    was_available = true;
                    tokio::spawn(reboot_and_check(state.clone(), process.clone()));
                    intake::check_outstanding_requests(&state).await;
                }
                tokio::select! {
                    live = monitor.changed() => {
                        if !live {
                            return;
                        }
                    }
                    _ = shutdown.recv() => return,
                }
                continue;
            }

            was_available = false;
            // One eviction deadline per outage; only this address coming
            // back resets it.
            let deadline = tokio::time::sleep(state.tuning.worker_failure_time);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = &mut deadline => {
                        evict_worker(&state, &process, &worker).await;
                        return;
                    }
                    live = monitor.changed() => {
                        if monitor.is_available(address) {
                            break;
                        }
                        if !live {
                            return;
                        }
                    }
                    _ = shutdown.recv() => return,
                }
            }
        }
    })
}

/// Remove a failed worker: resolve its lease, drop the registry entry,
/// and tombstone it in the published worker list.
async fn evict_worker(state: &Arc<ClusterState>, process: &ProcessId, worker: &WorkerHandle) {
    let removed = {
        let mut workers = state.workers.write().await;
        // Only this incarnation's watcher may evict; a replacement
        // registration has already superseded us otherwise.
        let ours = workers
            .get(process)
            .map(|info| info.worker.id == worker.id)
            .unwrap_or(false);
        if ours {
            let mut info = workers.remove(process).expect("presence checked above");
            info.release_reply();
        }
        ours
    };

    if removed {
        warn!(
            controller_id = %state.id,
            process = %process,
            address = %worker.address(),
            "Worker failed, removed from registry"
        );
        let _ = state.worker_list.send((process.clone(), None));
        intake::check_outstanding_requests(state).await;
    }
}

/// Debounce an availability regain: count the reboot for the shutdown
/// window, then re-evaluate master placement once the worker looks stable.
async fn reboot_and_check(state: Arc<ClusterState>, process: ProcessId) {
    {
        let mut workers = state.workers.write().await;
        match workers.get_mut(&process) {
            Some(info) => info.reboots += 1,
            None => return,
        }
    }

    tokio::time::sleep(state.tuning.shutdown_timeout).await;

    let stable = {
        let mut workers = state.workers.write().await;
        match workers.get_mut(&process) {
            Some(info) => {
                info.reboots -= 1;
                info.reboots < 2
            }
            None => return,
        }
    };

    if stable {
        state.trigger_better_master_check();
    }
}

/// Persist worker-list deltas through the external store.
///
/// Clears the range once at startup, then batches whatever deltas have
/// accumulated into one write with at-least-once semantics. Only the
/// elected controller writes this range, so there is no contention.
pub(crate) async fn run_worker_list_publisher(
    metastore: Arc<dyn MetaStore>,
    mut deltas: mpsc::UnboundedReceiver<(ProcessId, Option<ProcessData>)>,
    shutdown: ShutdownCoordinator,
) -> Result<()> {
    store::with_retry("clear_worker_list", || {
        metastore.apply(vec![Mutation::ClearRange(
            keys::WORKER_LIST_PREFIX.to_string(),
        )])
    })
    .await?;
    info!("Worker list cleared for new controller");

    loop {
        let first = tokio::select! {
            delta = deltas.recv() => match delta {
                Some(delta) => delta,
                None => return Ok(()),
            },
            _ = shutdown.wait() => return Ok(()),
        };

        let mut batch: HashMap<ProcessId, Option<ProcessData>> = HashMap::new();
        batch.insert(first.0, first.1);
        while let Ok((process, data)) = deltas.try_recv() {
            batch.insert(process, data);
        }

        debug!(delta_count = batch.len(), "Writing worker list delta");

        let mut mutations = Vec::with_capacity(batch.len());
        for (process, data) in &batch {
            match data {
                Some(data) => mutations.push(Mutation::Set(
                    keys::worker_list(process),
                    serde_json::to_vec(data)?,
                )),
                None => mutations.push(Mutation::Clear(keys::worker_list(process))),
            }
        }

        store::with_retry("write_worker_list", || metastore.apply(mutations.clone())).await?;
    }
}
