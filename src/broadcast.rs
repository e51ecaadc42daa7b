//! Versioned broadcast snapshots of cluster state.
//!
//! The controller publishes two snapshots: [`ServerDbInfo`] for server
//! processes and [`ClientDbInfo`] for clients. Every publish bumps the
//! snapshot's id, and ids are strictly monotonic, so a subscriber holding
//! id `v` detects change with a single comparison and can long-poll on the
//! underlying watch channel.

use crate::messages::{MasterHandle, WorkerHandle};
use crate::types::{ProcessId, RecoveryState};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use uuid::Uuid;

/// A snapshot carrying a monotonically increasing id.
pub trait Versioned {
    fn version(&self) -> u64;
    fn set_version(&mut self, version: u64);
}

/// Publisher of a versioned snapshot over a watch channel.
pub struct Broadcast<T> {
    tx: watch::Sender<T>,
    next: AtomicU64,
}

impl<T: Versioned + Clone + Send + Sync + 'static> Broadcast<T> {
    pub fn new(mut initial: T) -> Self {
        initial.set_version(1);
        let (tx, _) = watch::channel(initial);
        Self {
            tx,
            next: AtomicU64::new(2),
        }
    }

    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }

    pub fn version(&self) -> u64 {
        self.tx.borrow().version()
    }

    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }

    /// Mutate the snapshot and publish it under a fresh id. Returns the id.
    pub fn publish_with(&self, f: impl FnOnce(&mut T)) -> u64 {
        let version = self.next.fetch_add(1, Ordering::SeqCst);
        self.tx.send_modify(|value| {
            f(value);
            value.set_version(version);
        });
        version
    }
}

/// Transaction-log placement as reported by the master.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogSystemConfig {
    pub logs: Vec<WorkerHandle>,
    pub replication_factor: usize,
}

/// Snapshot broadcast to every server process.
#[derive(Debug, Clone, Default)]
pub struct ServerDbInfo {
    /// Changes whenever any other field changes. Strictly monotonic.
    pub id: u64,
    /// The controller that published this snapshot.
    pub controller_id: Uuid,
    pub master: Option<MasterHandle>,
    /// Increments on every master recruitment.
    pub master_lifetime: u64,
    pub log_system: LogSystemConfig,
    pub resolvers: Vec<WorkerHandle>,
    pub recovery_state: RecoveryState,
    pub recovery_count: u64,
    pub prior_committed_log_workers: Vec<ProcessId>,
    pub client: ClientDbInfo,
}

impl Versioned for ServerDbInfo {
    fn version(&self) -> u64 {
        self.id
    }

    fn set_version(&mut self, version: u64) {
        self.id = version;
    }
}

/// Snapshot broadcast to clients.
#[derive(Debug, Clone, Default)]
pub struct ClientDbInfo {
    /// Changes whenever any other field changes. Strictly monotonic.
    pub id: u64,
    pub proxies: Vec<WorkerHandle>,
    pub txn_sample_rate: Option<f64>,
    pub txn_size_limit: Option<i64>,
}

impl Versioned for ClientDbInfo {
    fn version(&self) -> u64 {
        self.id
    }

    fn set_version(&mut self, version: u64) {
        self.id = version;
    }
}
