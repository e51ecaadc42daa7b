//! Common test utilities for integration tests.

use keystone::config::KeystoneConfig;
use keystone::controller::{Controller, ControllerOptions};
use keystone::error::Result;
use keystone::failure::{FailureMonitoringReply, FailureMonitoringRequest, FailureStatus};
use keystone::messages::{
    ControllerRequest, MasterHandle, RecruitFromConfigurationReply, RecruitMasterRequest,
    RegisterMasterRequest, RegisterWorkerRequest, WorkerChannels, WorkerHandle,
};
use keystone::policy::{LocalityDimension, PolicyAcross, PolicyOne, ReplicationPolicy};
use keystone::store::MemoryStore;
use keystone::types::{
    ClassSource, ClassType, DatabaseConfiguration, Locality, ProcessClass, RecoveryState,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Generous bound for awaiting controller reactions under paused time.
pub const WAIT: Duration = Duration::from_secs(30);

/// A controller wired to an in-memory store with test-sized timeouts and
/// a fixed placement seed.
pub struct TestCluster {
    pub controller: Controller,
    pub store: Arc<MemoryStore>,
    pub config: KeystoneConfig,
}

impl TestCluster {
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    pub async fn start_with(adjust: impl FnOnce(&mut KeystoneConfig)) -> Self {
        let mut config = KeystoneConfig::default();
        config.tuning.attempt_recruitment_delay = Duration::from_millis(10);
        config.tuning.wait_for_good_recruitment_delay = Duration::from_secs(1);
        config.tuning.master_spin_delay = Duration::from_millis(50);
        config.tuning.check_better_master_interval = Duration::from_millis(100);
        config.tuning.recruitment_timeout = Duration::from_secs(2);
        config.tuning.worker_failure_time = Duration::from_millis(500);
        config.tuning.shutdown_timeout = Duration::from_millis(200);
        config.tuning.info_park_timeout = Duration::from_millis(100);
        config.tuning.worker_coordination_ping_delay = Duration::from_secs(600);
        config.failure.client_request_interval = Duration::from_millis(100);
        config.failure.failure_min_delay = Duration::from_millis(100);
        config.failure.failure_max_delay = Duration::from_millis(500);
        adjust(&mut config);

        let store = MemoryStore::new();
        let options = ControllerOptions::new(config.clone(), store.clone()).with_rng_seed(42);
        let controller = Controller::start(options, futures::future::pending());

        // Let the startup tasks (class monitor, worker list clear) settle.
        tokio::time::sleep(Duration::from_millis(10)).await;

        Self {
            controller,
            store,
            config,
        }
    }

    /// Register a worker with generation 1; returns its test-side half.
    pub async fn register_worker(&self, process: &str, zone: &str, class: ClassType) -> TestWorker {
        self.register_incarnation(process, zone, class, 1).await
    }

    /// Register a fresh incarnation with an explicit generation.
    pub async fn register_incarnation(
        &self,
        process: &str,
        zone: &str,
        class: ClassType,
        generation: u64,
    ) -> TestWorker {
        let (handle, channels) = WorkerHandle::new(Locality::new(process, zone, next_address()));
        let standdown = self.send_registration(handle.clone(), class, generation).await;
        TestWorker {
            handle,
            channels,
            standdown,
            generation,
        }
    }

    /// Re-send a registration for an existing incarnation; returns the new
    /// stand-down lease.
    pub async fn reregister(
        &self,
        handle: WorkerHandle,
        class: ClassType,
        generation: u64,
    ) -> oneshot::Receiver<()> {
        self.send_registration(handle, class, generation).await
    }

    async fn send_registration(
        &self,
        handle: WorkerHandle,
        class: ClassType,
        generation: u64,
    ) -> oneshot::Receiver<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.controller
            .requests
            .send(ControllerRequest::RegisterWorker(RegisterWorkerRequest {
                worker: handle,
                generation,
                class: ProcessClass::new(class, ClassSource::CommandLine),
                reply: reply_tx,
            }))
            .await
            .expect("controller accepts requests");

        // Let the registration apply before the test proceeds.
        tokio::time::sleep(Duration::from_millis(5)).await;
        reply_rx
    }

    /// One failure-monitoring poll on behalf of `address`.
    pub async fn failure_ping(
        &self,
        address: SocketAddr,
        version: u64,
    ) -> Result<FailureMonitoringReply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.controller
            .failure_requests
            .send(FailureMonitoringRequest {
                peer: address,
                version,
                sender_status: Some(FailureStatus::available()),
                reply: reply_tx,
            })
            .await
            .expect("failure server accepts requests");
        reply_rx.await.expect("failure server replies")
    }

    /// Mark an address failed: enter it into the detector, then stay
    /// silent until the sweep declares it dead.
    pub async fn fail_address(&self, address: SocketAddr) {
        self.failure_ping(address, 0).await.unwrap();
        tokio::time::sleep(self.config.failure.failure_max_delay * 2).await;
        assert!(!self.controller.monitor().is_available(address));
    }

    pub async fn recruit(
        &self,
        configuration: DatabaseConfiguration,
    ) -> oneshot::Receiver<Result<RecruitFromConfigurationReply>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.controller
            .requests
            .send(ControllerRequest::RecruitFromConfiguration(
                keystone::messages::RecruitFromConfigurationRequest {
                    configuration,
                    reply: reply_tx,
                },
            ))
            .await
            .expect("controller accepts requests");
        reply_rx
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn register_master(
        &self,
        master: &MasterHandle,
        registration_count: u64,
        configuration: DatabaseConfiguration,
        logs: Vec<WorkerHandle>,
        proxies: Vec<WorkerHandle>,
        resolvers: Vec<WorkerHandle>,
        recovery_state: RecoveryState,
    ) {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.controller
            .requests
            .send(ControllerRequest::RegisterMaster(RegisterMasterRequest {
                master_id: master.id,
                master: master.clone(),
                registration_count,
                configuration: configuration.clone(),
                log_system: keystone::broadcast::LogSystemConfig {
                    logs,
                    replication_factor: configuration.log_replication_factor,
                },
                proxies,
                resolvers,
                recovery_state,
                recovery_count: registration_count,
                prior_committed_log_workers: Vec::new(),
                reply: reply_tx,
            }))
            .await
            .expect("controller accepts requests");
        reply_rx.await.expect("registration acknowledged");
        // The acknowledgement precedes snapshot publication; let it land.
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// The worker-process half of a registration.
pub struct TestWorker {
    pub handle: WorkerHandle,
    pub channels: WorkerChannels,
    pub standdown: oneshot::Receiver<()>,
    pub generation: u64,
}

impl TestWorker {
    pub fn address(&self) -> SocketAddr {
        self.handle.address()
    }

    /// Await a master recruitment and accept it. Returns once the
    /// controller has published the new master.
    pub async fn accept_master_recruitment(&mut self) -> MasterHandle {
        let request = tokio::time::timeout(WAIT, self.channels.recruit_master.recv())
            .await
            .expect("master recruitment expected")
            .expect("recruitment channel open");
        let master = self.grant_master(request);
        tokio::time::sleep(Duration::from_millis(10)).await;
        master
    }

    pub fn grant_master(&self, request: RecruitMasterRequest) -> MasterHandle {
        let master = MasterHandle {
            id: Uuid::new_v4(),
            locality: self.handle.locality.clone(),
        };
        request
            .reply
            .send(master.clone())
            .expect("controller awaits recruitment reply");
        master
    }
}

static NEXT_PORT: std::sync::atomic::AtomicU16 = std::sync::atomic::AtomicU16::new(10_000);

pub fn next_address() -> SocketAddr {
    let port = NEXT_PORT.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    format!("127.0.0.1:{}", port).parse().unwrap()
}

/// Configuration with a distinct-zone log policy, the shape most
/// scenarios use.
pub fn zone_spread_config(replication: usize, desired_logs: usize) -> DatabaseConfiguration {
    let policy: Arc<dyn ReplicationPolicy> = if replication > 1 {
        Arc::new(PolicyAcross::new(replication, LocalityDimension::Zone))
    } else {
        Arc::new(PolicyOne)
    };
    DatabaseConfiguration {
        log_replication_factor: replication,
        desired_logs,
        desired_proxies: 1,
        desired_resolvers: 1,
        log_policy: policy,
        ..Default::default()
    }
}
