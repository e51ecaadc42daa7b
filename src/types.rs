//! Core type definitions for the Keystone cluster controller.
//!
//! This module contains the fundamental data types used throughout the
//! controller: process identities and locality labels, process classes and
//! the fitness ordering that drives role placement, and the subset of the
//! database configuration the controller consumes.
//!
//! # Key Types
//!
//! - [`ProcessId`] / [`ZoneId`] / [`DataHallId`] / [`DcId`]: opaque locality labels
//! - [`Locality`]: the nested fault domains attached to every worker
//! - [`ProcessClass`]: declared (or database-configured) role preference
//! - [`Fitness`]: ordinal goodness of assigning a process to a role (lower is better)
//! - [`DatabaseConfiguration`]: replication and role-count targets for recruitment

use crate::policy::{PolicyOne, ReplicationPolicy};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use uuid::Uuid;

/// Stable, opaque identifier for a process. Survives restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessId(String);

/// Opaque fault-domain label: one failure unit of machines.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ZoneId(String);

/// Opaque fault-domain label: one hall of zones.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DataHallId(String);

/// Opaque fault-domain label: one datacenter of halls.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DcId(String);

macro_rules! opaque_id {
    ($name:ident) => {
        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

opaque_id!(ProcessId);
opaque_id!(ZoneId);
opaque_id!(DataHallId);
opaque_id!(DcId);

/// Ephemeral identity of one worker incarnation. A restarted process
/// registers with a fresh worker id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub Uuid);

impl WorkerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-process monotonic registration counter. Older generations are
/// rejected to protect against replayed registrations.
pub type Generation = u64;

/// Nested fault domains attached to each worker, plus its network address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locality {
    pub process: ProcessId,
    pub zone: ZoneId,
    pub data_hall: Option<DataHallId>,
    pub dc: Option<DcId>,
    pub address: SocketAddr,
}

impl Locality {
    pub fn new(process: impl Into<String>, zone: impl Into<String>, address: SocketAddr) -> Self {
        Self {
            process: ProcessId::new(process),
            zone: ZoneId::new(zone),
            data_hall: None,
            dc: None,
            address,
        }
    }

    pub fn with_dc(mut self, dc: impl Into<String>) -> Self {
        self.dc = Some(DcId::new(dc));
        self
    }

    pub fn with_data_hall(mut self, hall: impl Into<String>) -> Self {
        self.data_hall = Some(DataHallId::new(hall));
        self
    }
}

impl fmt::Display for Locality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "process={} zone={} dc={} addr={}",
            self.process,
            self.zone,
            self.dc.as_ref().map(|d| d.as_str()).unwrap_or("-"),
            self.address
        )
    }
}

/// Declared role preference of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassType {
    Unset,
    Storage,
    TransactionLog,
    Proxy,
    Resolver,
    Master,
    Tester,
}

impl fmt::Display for ClassType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClassType::Unset => "unset",
            ClassType::Storage => "storage",
            ClassType::TransactionLog => "transaction_log",
            ClassType::Proxy => "proxy",
            ClassType::Resolver => "resolver",
            ClassType::Master => "master",
            ClassType::Tester => "tester",
        };
        write!(f, "{}", s)
    }
}

/// Where a process class came from. Controls which side wins when the
/// database-configured class disagrees with the advertised one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassSource {
    CommandLine,
    Db,
    Auto,
}

/// A process class: the declared type plus its provenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessClass {
    pub class_type: ClassType,
    pub class_source: ClassSource,
}

impl ProcessClass {
    pub fn new(class_type: ClassType, class_source: ClassSource) -> Self {
        Self {
            class_type,
            class_source,
        }
    }

    pub fn unset() -> Self {
        Self::new(ClassType::Unset, ClassSource::CommandLine)
    }

    /// Fitness of this class for the given role. Lower is better;
    /// [`Fitness::NeverAssign`] disqualifies the worker outright.
    pub fn fitness(&self, role: ClusterRole) -> Fitness {
        if self.class_type == ClassType::Tester {
            return Fitness::NeverAssign;
        }
        match role {
            ClusterRole::Storage => match self.class_type {
                ClassType::Storage => Fitness::Best,
                ClassType::Unset => Fitness::UnsetFit,
                _ => Fitness::Worst,
            },
            ClusterRole::TransactionLog => match self.class_type {
                ClassType::TransactionLog => Fitness::Best,
                ClassType::Storage => Fitness::Okay,
                ClassType::Unset => Fitness::UnsetFit,
                _ => Fitness::Worst,
            },
            ClusterRole::Proxy => match self.class_type {
                ClassType::Proxy => Fitness::Best,
                ClassType::Unset => Fitness::UnsetFit,
                _ => Fitness::Worst,
            },
            ClusterRole::Resolver => match self.class_type {
                ClassType::Resolver => Fitness::Best,
                ClassType::Unset => Fitness::UnsetFit,
                _ => Fitness::Worst,
            },
            ClusterRole::Master => match self.class_type {
                ClassType::Master => Fitness::Best,
                ClassType::Unset => Fitness::UnsetFit,
                _ => Fitness::Worst,
            },
        }
    }
}

impl Default for ProcessClass {
    fn default() -> Self {
        Self::unset()
    }
}

impl fmt::Display for ProcessClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.class_type)
    }
}

/// Roles the controller places workers into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterRole {
    Storage,
    TransactionLog,
    Proxy,
    Resolver,
    Master,
}

/// Ordinal placement quality. Variant order is the ordering: earlier
/// variants compare less-than (better) later ones.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Fitness {
    Best,
    Good,
    Okay,
    UnsetFit,
    Worst,
    NeverAssign,
}

/// Recovery progress reported by the master. Ordinal: later variants mean
/// further along.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryState {
    #[default]
    Uninitialized,
    ReadingCoordinatedState,
    LockingOldLogs,
    Recruiting,
    AcceptingCommits,
    FullyRecovered,
}

/// Persisted description of a registered process, written to the external
/// metadata store's worker list so other components can enumerate workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessData {
    pub locality: Locality,
    pub class: ProcessClass,
    pub address: SocketAddr,
}

/// The subset of the database-wide configuration the controller consumes
/// for recruitment: replication factor, desired role counts, exclusions,
/// and the log replication policy.
#[derive(Clone)]
pub struct DatabaseConfiguration {
    pub log_replication_factor: usize,
    pub desired_logs: usize,
    pub desired_proxies: usize,
    pub desired_resolvers: usize,
    pub excluded_addresses: HashSet<SocketAddr>,
    pub log_policy: Arc<dyn ReplicationPolicy>,
}

impl DatabaseConfiguration {
    /// Desired log count never falls below the replication factor.
    pub fn desired_logs(&self) -> usize {
        self.desired_logs.max(self.log_replication_factor)
    }

    pub fn desired_proxies(&self) -> usize {
        self.desired_proxies.max(1)
    }

    pub fn desired_resolvers(&self) -> usize {
        self.desired_resolvers.max(1)
    }

    pub fn is_excluded(&self, address: &SocketAddr) -> bool {
        self.excluded_addresses.contains(address)
    }
}

impl Default for DatabaseConfiguration {
    fn default() -> Self {
        Self {
            log_replication_factor: 1,
            desired_logs: 3,
            desired_proxies: 1,
            desired_resolvers: 1,
            excluded_addresses: HashSet::new(),
            log_policy: Arc::new(PolicyOne),
        }
    }
}

impl fmt::Debug for DatabaseConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfiguration")
            .field("log_replication_factor", &self.log_replication_factor)
            .field("desired_logs", &self.desired_logs)
            .field("desired_proxies", &self.desired_proxies)
            .field("desired_resolvers", &self.desired_resolvers)
            .field("excluded_addresses", &self.excluded_addresses)
            .field("log_policy", &self.log_policy.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fitness_ordering() {
        assert!(Fitness::Best < Fitness::Good);
        assert!(Fitness::Good < Fitness::Okay);
        assert!(Fitness::Okay < Fitness::UnsetFit);
        assert!(Fitness::UnsetFit < Fitness::Worst);
        assert!(Fitness::Worst < Fitness::NeverAssign);
    }

    #[test]
    fn test_tester_never_assigned() {
        let tester = ProcessClass::new(ClassType::Tester, ClassSource::CommandLine);
        for role in [
            ClusterRole::Storage,
            ClusterRole::TransactionLog,
            ClusterRole::Proxy,
            ClusterRole::Resolver,
            ClusterRole::Master,
        ] {
            assert_eq!(tester.fitness(role), Fitness::NeverAssign);
        }
    }

    #[test]
    fn test_matching_class_is_best_fit() {
        let log = ProcessClass::new(ClassType::TransactionLog, ClassSource::CommandLine);
        assert_eq!(log.fitness(ClusterRole::TransactionLog), Fitness::Best);
        assert_eq!(log.fitness(ClusterRole::Storage), Fitness::Worst);

        let unset = ProcessClass::unset();
        assert_eq!(unset.fitness(ClusterRole::Storage), Fitness::UnsetFit);
        assert_eq!(unset.fitness(ClusterRole::Master), Fitness::UnsetFit);
    }

    #[test]
    fn test_storage_class_acceptable_for_logs() {
        let storage = ProcessClass::new(ClassType::Storage, ClassSource::CommandLine);
        assert_eq!(storage.fitness(ClusterRole::TransactionLog), Fitness::Okay);
        assert!(storage.fitness(ClusterRole::TransactionLog) < Fitness::UnsetFit);
    }

    #[test]
    fn test_cross_role_classes_are_worst_fit() {
        // A declared class only helps for its own role; every other
        // stateless-role pairing ranks below an undeclared worker.
        let proxy = ProcessClass::new(ClassType::Proxy, ClassSource::CommandLine);
        let resolver = ProcessClass::new(ClassType::Resolver, ClassSource::CommandLine);
        let log = ProcessClass::new(ClassType::TransactionLog, ClassSource::CommandLine);
        let storage = ProcessClass::new(ClassType::Storage, ClassSource::CommandLine);

        assert_eq!(resolver.fitness(ClusterRole::Proxy), Fitness::Worst);
        assert_eq!(log.fitness(ClusterRole::Proxy), Fitness::Worst);
        assert_eq!(proxy.fitness(ClusterRole::Resolver), Fitness::Worst);
        assert_eq!(log.fitness(ClusterRole::Resolver), Fitness::Worst);
        assert_eq!(proxy.fitness(ClusterRole::Master), Fitness::Worst);
        assert_eq!(resolver.fitness(ClusterRole::Master), Fitness::Worst);
        assert_eq!(storage.fitness(ClusterRole::Master), Fitness::Worst);
    }

    #[test]
    fn test_desired_counts_floor() {
        let conf = DatabaseConfiguration {
            log_replication_factor: 3,
            desired_logs: 1,
            desired_proxies: 0,
            desired_resolvers: 0,
            ..Default::default()
        };
        assert_eq!(conf.desired_logs(), 3);
        assert_eq!(conf.desired_proxies(), 1);
        assert_eq!(conf.desired_resolvers(), 1);
    }
}
