//! Keystone - the control plane of a distributed transactional storage cluster.
//!
//! Exactly one controller is elected at a time via an external coordination
//! service. While elected, it is the authoritative source of cluster
//! membership, role placement, process-class policy, and database-wide
//! configuration broadcast. It also hosts the failure-detection service
//! that every other process polls, and recruits the master process that in
//! turn owns recovery and the transaction subsystem.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Cluster Controller                        │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Intake: register / recruit / status / info long-polls        │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Worker Registry │ Placement Engine │ Master Lifecycle        │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Failure Detection Server │ DB Info Broadcast │ Class Sync    │
//! ├──────────────────────────────────────────────────────────────┤
//! │  External seams: election │ metadata store │ RPC transport    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use keystone::config::KeystoneConfig;
//! use keystone::controller::{Controller, ControllerOptions};
//! use keystone::store::MemoryStore;
//!
//! #[tokio::main]
//! async fn main() -> keystone::Result<()> {
//!     let config = KeystoneConfig::development();
//!     let options = ControllerOptions::new(config, MemoryStore::new());
//!     let controller = Controller::start(options, futures::future::pending());
//!     controller.join().await
//! }
//! ```

pub mod broadcast;
pub mod config;
pub mod controller;
pub mod error;
pub mod failure;
pub mod messages;
pub mod observability;
pub mod policy;
pub mod shutdown;
pub mod store;
pub mod types;

pub use error::{KeystoneError, Result};
