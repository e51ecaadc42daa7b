//! The cluster controller: the elected control-plane process.
//!
//! While elected, the controller is the authoritative source of cluster
//! membership, role placement, process-class policy, and database-wide
//! configuration broadcast. It hosts the failure-detection server every
//! other process polls, and recruits the master process that owns recovery
//! and the transaction subsystem.
//!
//! [`ClusterState`] is the single owning aggregate for all mutable state:
//! the worker registry, pending recruitment queues, the broadcast
//! snapshots, and the shared RNG. Handler tasks borrow it through an
//! `Arc`; there are no process-wide singletons.

mod classes;
mod intake;
mod master;
mod placement;
mod registry;

pub use registry::WorkerInfo;

use crate::broadcast::{Broadcast, ClientDbInfo, ServerDbInfo};
use crate::config::{ControllerTuning, KeystoneConfig};
use crate::error::{KeystoneError, Result};
use crate::failure::{FailureDetectionServer, FailureMonitor, FailureMonitoringRequest};
use crate::messages::{ControllerRequest, RecruitFromConfigurationRequest, RecruitStorageRequest};
use crate::shutdown::ShutdownCoordinator;
use crate::store::MetaStore;
use crate::types::{DatabaseConfiguration, ProcessClass, ProcessData, ProcessId};
use futures::future::BoxFuture;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex, Notify, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

/// All mutable controller state, owned by one aggregate and shared by the
/// controller's tasks.
pub struct ClusterState {
    /// Identity of this controller incarnation.
    pub id: Uuid,
    pub(crate) tuning: ControllerTuning,
    pub(crate) start_time: Instant,
    pub(crate) workers: RwLock<HashMap<ProcessId, WorkerInfo>>,
    /// Process classes read from the external store, keyed by process.
    pub(crate) id_class: RwLock<HashMap<ProcessId, ProcessClass>>,
    pub(crate) got_process_classes: AtomicBool,
    /// Process hosting the current (or most recently recruited) master.
    pub(crate) master_process: RwLock<Option<ProcessId>>,
    pub server_info: Broadcast<ServerDbInfo>,
    pub client_info: Broadcast<ClientDbInfo>,
    /// Configuration reported by the master; cleared on each recruitment.
    pub(crate) db_config: RwLock<Option<DatabaseConfiguration>>,
    pub(crate) master_registration_count: AtomicU64,
    force_master_failure: parking_lot::Mutex<Option<oneshot::Sender<()>>>,
    pub(crate) pending_recruits: AsyncMutex<Vec<RecruitFromConfigurationRequest>>,
    pub(crate) pending_storage: AsyncMutex<Vec<(RecruitStorageRequest, Instant)>>,
    /// Single RNG behind all placement tie-breaks; seeded in simulation.
    pub(crate) rng: parking_lot::Mutex<StdRng>,
    monitor: FailureMonitor,
    pub(crate) worker_list: mpsc::UnboundedSender<(ProcessId, Option<ProcessData>)>,
    pub(crate) better_master_check: Notify,
    pub(crate) worker_issues: RwLock<HashMap<SocketAddr, (String, Uuid)>>,
    pub(crate) client_issues: RwLock<HashMap<SocketAddr, (String, Uuid)>>,
    pub(crate) incompatible_peers: RwLock<HashMap<SocketAddr, Instant>>,
    pub(crate) shutdown: ShutdownCoordinator,
    fatal: parking_lot::Mutex<Option<KeystoneError>>,
    fatal_notify: Notify,
}

impl ClusterState {
    #[allow(clippy::too_many_arguments)]
    fn new(
        id: Uuid,
        config: &KeystoneConfig,
        monitor: FailureMonitor,
        worker_list: mpsc::UnboundedSender<(ProcessId, Option<ProcessData>)>,
        shutdown: ShutdownCoordinator,
        rng_seed: Option<u64>,
    ) -> Arc<Self> {
        let rng = match rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Arc::new(Self {
            id,
            tuning: config.tuning.clone(),
            start_time: Instant::now(),
            workers: RwLock::new(HashMap::new()),
            id_class: RwLock::new(HashMap::new()),
            got_process_classes: AtomicBool::new(false),
            master_process: RwLock::new(None),
            server_info: Broadcast::new(ServerDbInfo {
                controller_id: id,
                ..Default::default()
            }),
            client_info: Broadcast::new(ClientDbInfo::default()),
            db_config: RwLock::new(None),
            master_registration_count: AtomicU64::new(0),
            force_master_failure: parking_lot::Mutex::new(None),
            pending_recruits: AsyncMutex::new(Vec::new()),
            pending_storage: AsyncMutex::new(Vec::new()),
            rng: parking_lot::Mutex::new(rng),
            monitor,
            worker_list,
            better_master_check: Notify::new(),
            worker_issues: RwLock::new(HashMap::new()),
            client_issues: RwLock::new(HashMap::new()),
            incompatible_peers: RwLock::new(HashMap::new()),
            shutdown,
            fatal: parking_lot::Mutex::new(None),
            fatal_notify: Notify::new(),
        })
    }

    pub(crate) fn monitor(&self) -> FailureMonitor {
        self.monitor.clone()
    }

    pub(crate) fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Inside the startup grace window, recruitment holds out for
    /// placements at the expected fitness targets.
    pub(crate) fn in_grace_window(&self) -> bool {
        self.uptime() < self.tuning.wait_for_good_recruitment_delay
    }

    pub(crate) fn got_process_classes(&self) -> bool {
        self.got_process_classes.load(Ordering::SeqCst)
    }

    /// Kick the debounced better-master evaluation.
    pub(crate) fn trigger_better_master_check(&self) {
        self.better_master_check.notify_one();
    }

    /// Re-arm the force-failure signal for a freshly recruited master.
    pub(crate) fn arm_master_failure(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        *self.force_master_failure.lock() = Some(tx);
        rx
    }

    /// Force the current master to be replaced. Returns false when the
    /// signal has already fired for this master.
    pub(crate) fn fire_master_failure(&self) -> bool {
        match self.force_master_failure.lock().take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    /// Record an unrecoverable error for the core loop to surface.
    pub(crate) fn report_fatal(&self, error: KeystoneError) {
        let mut slot = self.fatal.lock();
        if slot.is_none() {
            error!(error = %error, "Fatal controller error");
            *slot = Some(error);
        }
        self.fatal_notify.notify_one();
    }

    fn take_fatal(&self) -> Option<KeystoneError> {
        self.fatal.lock().take()
    }

    /// Number of registered workers. Exposed for tooling and tests.
    pub async fn worker_count(&self) -> usize {
        self.workers.read().await.len()
    }
}

/// Apply the configured jitter to a park timeout: uniformly within
/// [0.9, 1.1] of the nominal value so synchronized clients spread out.
pub(crate) fn jittered(duration: Duration, rng: &mut StdRng) -> Duration {
    duration.mul_f64(0.9 + 0.2 * rng.gen::<f64>())
}

/// Options for starting a controller.
pub struct ControllerOptions {
    pub config: KeystoneConfig,
    pub store: Arc<dyn MetaStore>,
    /// Seed for the placement RNG. Fixed seeds make placement
    /// deterministic for simulation-driven tests.
    pub rng_seed: Option<u64>,
    pub request_capacity: usize,
}

impl ControllerOptions {
    pub fn new(config: KeystoneConfig, store: Arc<dyn MetaStore>) -> Self {
        Self {
            config,
            store,
            rng_seed: None,
            request_capacity: 128,
        }
    }

    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }
}

/// A running controller: the channels to reach it and its core task.
pub struct Controller {
    pub requests: mpsc::Sender<ControllerRequest>,
    pub failure_requests: mpsc::Sender<FailureMonitoringRequest>,
    pub state: Arc<ClusterState>,
    task: JoinHandle<Result<()>>,
}

impl Controller {
    /// Start an elected controller. `leader_fail` resolves when leadership
    /// is lost, which shuts the controller down cleanly.
    pub fn start(
        options: ControllerOptions,
        leader_fail: impl Future<Output = ()> + Send + 'static,
    ) -> Controller {
        let id = Uuid::new_v4();
        let shutdown = ShutdownCoordinator::new();
        let (request_tx, request_rx) = mpsc::channel(options.request_capacity);
        let (failure_tx, failure_rx) = mpsc::channel(options.request_capacity);
        let (worker_list_tx, worker_list_rx) = mpsc::unbounded_channel();

        let (failure_server, monitor) = FailureDetectionServer::new(
            id,
            options.config.failure.clone(),
            options.config.node.listen_addr,
            failure_rx,
        );

        let state = ClusterState::new(
            id,
            &options.config,
            monitor,
            worker_list_tx,
            shutdown,
            options.rng_seed,
        );

        info!(controller_id = %id, "Starting cluster controller");

        let task = tokio::spawn(run_core(
            state.clone(),
            options.store,
            request_rx,
            failure_server,
            worker_list_rx,
            leader_fail,
        ));

        Controller {
            requests: request_tx,
            failure_requests: failure_tx,
            state,
            task,
        }
    }

    pub fn monitor(&self) -> FailureMonitor {
        self.state.monitor()
    }

    pub fn initiate_shutdown(&self, reason: &str) {
        self.state.shutdown.initiate(reason);
    }

    /// Wait for the controller to stop. A clean loss of leadership or
    /// shutdown returns `Ok(())`; anything else is the fatal error that
    /// ended the role.
    pub async fn join(self) -> Result<()> {
        match self.task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(KeystoneError::Internal(format!(
                "controller task panicked: {}",
                e
            ))),
        }
    }
}

/// The controller core: spawns the long-lived tasks and runs the intake
/// loop until leadership is lost, shutdown is initiated, or a task fails.
async fn run_core(
    state: Arc<ClusterState>,
    store: Arc<dyn MetaStore>,
    mut requests: mpsc::Receiver<ControllerRequest>,
    failure_server: FailureDetectionServer,
    worker_list_rx: mpsc::UnboundedReceiver<(ProcessId, Option<ProcessData>)>,
    leader_fail: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let mut tasks: JoinSet<Result<()>> = JoinSet::new();
    tasks.spawn(failure_server.run(state.shutdown.clone()));
    tasks.spawn(master::watch_database(state.clone()));
    tasks.spawn(registry::run_worker_list_publisher(
        store.clone(),
        worker_list_rx,
        state.shutdown.clone(),
    ));
    tasks.spawn(classes::monitor_process_classes(state.clone(), store.clone()));
    tasks.spawn(classes::monitor_client_txn_config(state.clone(), store));
    tasks.spawn(intake::better_master_checker(state.clone()));

    let mut ping_step: u64 = 0;
    let mut ping_interval = tokio::time::interval_at(
        Instant::now() + state.tuning.worker_coordination_ping_delay,
        state.tuning.worker_coordination_ping_delay,
    );
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    tokio::pin!(leader_fail);

    let outcome = loop {
        tokio::select! {
            request = requests.recv() => {
                match request {
                    Some(request) => {
                        if let Err(e) = intake::handle_request(&state, request, &mut tasks).await {
                            break Err(e);
                        }
                    }
                    None => {
                        state.shutdown.initiate("request channel closed");
                        break Ok(());
                    }
                }
            }
            _ = ping_interval.tick() => {
                ping_step += 1;
                intake::broadcast_coordination_ping(&state, ping_step).await;
            }
            _ = &mut leader_fail => {
                info!(controller_id = %state.id, "Leader replaced, ending controller role");
                state.shutdown.initiate("leader replaced");
                break Ok(());
            }
            _ = state.fatal_notify.notified() => {
                match state.take_fatal() {
                    Some(e) => break Err(e),
                    None => continue,
                }
            }
            Some(joined) = tasks.join_next() => {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(KeystoneError::Cancelled)) => {}
                    Ok(Err(e)) => break Err(e),
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => break Err(KeystoneError::Internal(format!("controller task panicked: {}", e))),
                }
            }
        }
    };

    if let Err(e) = &outcome {
        warn!(controller_id = %state.id, error = %e, "Controller stopping on error");
    }
    state.shutdown.initiate("controller stopping");
    // Evicted or not, every held worker reply must resolve exactly once so
    // workers stand down and re-register with the next controller.
    {
        let mut workers = state.workers.write().await;
        for (_, info) in workers.iter_mut() {
            info.release_reply();
            info.abort_watcher();
        }
        workers.clear();
    }
    tasks.shutdown().await;
    outcome
}

/// Leader-election seam. The election layer is an external collaborator;
/// the controller only needs "become leader" and a leadership-lost future.
#[async_trait::async_trait]
pub trait Election: Send + Sync + 'static {
    /// Resolves once elected, returning a future that resolves when
    /// leadership is lost. [`KeystoneError::CoordinatorsChanged`] asks the
    /// caller to reconnect and try again.
    async fn become_leader(&self) -> Result<BoxFuture<'static, ()>>;
}

/// Election stub that always wins and never revokes. Backs single-process
/// development runs and tests.
pub struct StaticElection;

#[async_trait::async_trait]
impl Election for StaticElection {
    async fn become_leader(&self) -> Result<BoxFuture<'static, ()>> {
        Ok(Box::pin(futures::future::pending()))
    }
}

/// Outer controller loop: win the election, run the controller role, and
/// stand for election again when leadership is lost. Coordinator changes
/// reconnect; any other error terminates the process's controller role.
pub async fn run_elected(
    election: Arc<dyn Election>,
    make_options: impl Fn() -> ControllerOptions,
) -> Result<()> {
    loop {
        let leader_fail = match election.become_leader().await {
            Ok(f) => f,
            Err(KeystoneError::CoordinatorsChanged) => {
                info!("Coordinators changed, reconnecting");
                continue;
            }
            Err(e) => return Err(e),
        };

        let controller = Controller::start(make_options(), leader_fail);
        match controller.join().await {
            Ok(()) => {
                info!("Controller role ended cleanly, standing for election again");
            }
            Err(KeystoneError::CoordinatorsChanged) => continue,
            Err(e) => return Err(e),
        }
    }
}
