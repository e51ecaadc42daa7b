//! Request, reply, and interface types for the controller.
//!
//! The transport is external: requests arrive on a channel already
//! deserialized, each carrying a oneshot reply. A [`WorkerHandle`] is the
//! controller's outbound face of one worker: the channels a recruitment
//! or coordination message travels over, plus the worker's locality.

use crate::broadcast::{ClientDbInfo, LogSystemConfig, ServerDbInfo};
use crate::error::Result;
use crate::types::{
    DatabaseConfiguration, DcId, Generation, Locality, ProcessClass, ProcessId, RecoveryState,
    WorkerId, ZoneId,
};
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Outbound channels and identity of one registered worker incarnation.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub id: WorkerId,
    pub locality: Locality,
    pub recruit_master: mpsc::Sender<RecruitMasterRequest>,
    pub coordination: mpsc::Sender<CoordinationPing>,
}

impl WorkerHandle {
    /// Build a handle plus the receiving ends a worker process would own.
    pub fn new(locality: Locality) -> (Self, WorkerChannels) {
        let (recruit_tx, recruit_rx) = mpsc::channel(4);
        let (coordination_tx, coordination_rx) = mpsc::channel(16);
        let handle = Self {
            id: WorkerId::new(),
            locality,
            recruit_master: recruit_tx,
            coordination: coordination_tx,
        };
        let channels = WorkerChannels {
            recruit_master: recruit_rx,
            coordination: coordination_rx,
        };
        (handle, channels)
    }

    pub fn address(&self) -> SocketAddr {
        self.locality.address
    }

    pub fn process_id(&self) -> &ProcessId {
        &self.locality.process
    }
}

/// Handles are interchangeable iff they are the same incarnation.
impl PartialEq for WorkerHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for WorkerHandle {}

/// The receiving ends matching a [`WorkerHandle`].
pub struct WorkerChannels {
    pub recruit_master: mpsc::Receiver<RecruitMasterRequest>,
    pub coordination: mpsc::Receiver<CoordinationPing>,
}

/// Identity of a recruited master.
#[derive(Debug, Clone)]
pub struct MasterHandle {
    pub id: Uuid,
    pub locality: Locality,
}

impl MasterHandle {
    pub fn address(&self) -> SocketAddr {
        self.locality.address
    }
}

impl PartialEq for MasterHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for MasterHandle {}

/// Sent to a chosen worker to start a master. The lifetime identifies the
/// recruitment so stale masters can be fenced.
#[derive(Debug)]
pub struct RecruitMasterRequest {
    pub lifetime: u64,
    pub reply: oneshot::Sender<MasterHandle>,
}

/// Periodic broadcast so workers know which controller is live.
#[derive(Debug, Clone, Copy)]
pub struct CoordinationPing {
    pub controller_id: Uuid,
    pub step: u64,
}

/// Worker registration. The reply is held open by the controller as a
/// stand-down lease: it resolves when this registration is superseded or
/// the worker is evicted.
#[derive(Debug)]
pub struct RegisterWorkerRequest {
    pub worker: WorkerHandle,
    pub generation: Generation,
    pub class: ProcessClass,
    pub reply: oneshot::Sender<()>,
}

/// Master state report. Gated on the master id and a monotonic
/// registration count.
#[derive(Debug)]
pub struct RegisterMasterRequest {
    pub master_id: Uuid,
    pub master: MasterHandle,
    pub registration_count: u64,
    pub configuration: DatabaseConfiguration,
    pub log_system: LogSystemConfig,
    pub proxies: Vec<WorkerHandle>,
    pub resolvers: Vec<WorkerHandle>,
    pub recovery_state: RecoveryState,
    pub recovery_count: u64,
    pub prior_committed_log_workers: Vec<ProcessId>,
    pub reply: oneshot::Sender<()>,
}

/// Full recruitment of the transaction subsystem for a configuration.
#[derive(Debug)]
pub struct RecruitFromConfigurationRequest {
    pub configuration: DatabaseConfiguration,
    pub reply: oneshot::Sender<Result<RecruitFromConfigurationReply>>,
}

#[derive(Debug, Clone)]
pub struct RecruitFromConfigurationReply {
    pub logs: Vec<WorkerHandle>,
    pub proxies: Vec<WorkerHandle>,
    pub resolvers: Vec<WorkerHandle>,
}

/// Recruitment of a single storage worker.
#[derive(Debug)]
pub struct RecruitStorageRequest {
    pub exclude_machines: Vec<ZoneId>,
    pub exclude_dcs: Vec<DcId>,
    pub exclude_addresses: Vec<SocketAddr>,
    /// Relax fitness requirements: the cluster has no viable alternative.
    pub critical_recruitment: bool,
    pub reply: oneshot::Sender<Result<RecruitStorageReply>>,
}

#[derive(Debug, Clone)]
pub struct RecruitStorageReply {
    pub worker: WorkerHandle,
    pub class: ProcessClass,
}

/// Worker enumeration for tooling.
#[derive(Debug)]
pub struct GetWorkersRequest {
    /// Restrict to tester-class workers.
    pub testers_only: bool,
    pub reply: oneshot::Sender<Vec<(WorkerHandle, ProcessClass)>>,
}

/// Long-poll for a newer server snapshot.
#[derive(Debug)]
pub struct GetServerDbInfoRequest {
    pub peer: SocketAddr,
    pub known_id: u64,
    pub issues: Vec<String>,
    pub incompatible_peers: Vec<SocketAddr>,
    pub reply: oneshot::Sender<ServerDbInfo>,
}

/// Long-poll for a newer client snapshot.
#[derive(Debug)]
pub struct OpenDatabaseRequest {
    pub peer: SocketAddr,
    pub known_id: u64,
    pub issues: Vec<String>,
    pub supported_versions: Vec<String>,
    pub reply: oneshot::Sender<ClientDbInfo>,
}

/// Point-in-time cluster summary. The deep status report is produced by an
/// external collector; this is the controller's own view.
#[derive(Debug)]
pub struct StatusRequest {
    pub reply: oneshot::Sender<ClusterStatus>,
}

#[derive(Debug, Clone)]
pub struct ClusterStatus {
    pub controller_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub workers: Vec<WorkerStatusEntry>,
    pub master: Option<MasterHandle>,
    pub recovery_state: RecoveryState,
    pub worker_issues: Vec<(SocketAddr, String)>,
    pub client_issues: Vec<(SocketAddr, String)>,
    pub incompatible_peers: Vec<SocketAddr>,
}

#[derive(Debug, Clone)]
pub struct WorkerStatusEntry {
    pub process: ProcessId,
    pub address: SocketAddr,
    pub class: ProcessClass,
    pub reboots: u32,
    pub available: bool,
}

/// Every request the intake loop dispatches.
#[derive(Debug)]
pub enum ControllerRequest {
    RegisterWorker(RegisterWorkerRequest),
    RegisterMaster(RegisterMasterRequest),
    RecruitFromConfiguration(RecruitFromConfigurationRequest),
    RecruitStorage(RecruitStorageRequest),
    GetWorkers(GetWorkersRequest),
    GetClientWorkers {
        reply: oneshot::Sender<Vec<WorkerHandle>>,
    },
    GetServerDbInfo(GetServerDbInfoRequest),
    OpenDatabase(OpenDatabaseRequest),
    GetStatus(StatusRequest),
    Ping {
        reply: oneshot::Sender<()>,
    },
}
