//! Configuration module for the Keystone cluster controller.

use crate::error::{KeystoneError, Result};
use crate::types::Fitness;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Main configuration for a controller process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeystoneConfig {
    /// Node identity and bind address.
    pub node: NodeConfig,
    /// Recruitment and master-lifecycle tuning.
    pub tuning: ControllerTuning,
    /// Failure-detection server tuning.
    pub failure: FailureDetectionConfig,
    /// Logging configuration.
    pub observability: ObservabilityConfig,
}

impl KeystoneConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| KeystoneError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| KeystoneError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.tuning.worker_failure_time.is_zero() {
            return Err(KeystoneError::InvalidConfig {
                field: "tuning.worker_failure_time".to_string(),
                reason: "must be non-zero".to_string(),
            });
        }

        if self.failure.client_request_interval.is_zero() {
            return Err(KeystoneError::InvalidConfig {
                field: "failure.client_request_interval".to_string(),
                reason: "must be non-zero".to_string(),
            });
        }

        if self.failure.failure_max_delay < self.failure.failure_min_delay {
            return Err(KeystoneError::InvalidConfig {
                field: "failure.failure_max_delay".to_string(),
                reason: "must be at least failure_min_delay".to_string(),
            });
        }

        Ok(())
    }

    /// Configuration with timeouts shrunk for local development runs.
    pub fn development() -> Self {
        Self {
            node: NodeConfig::default(),
            tuning: ControllerTuning {
                recruitment_timeout: Duration::from_secs(10),
                shutdown_timeout: Duration::from_secs(1),
                worker_coordination_ping_delay: Duration::from_secs(5),
                ..Default::default()
            },
            failure: FailureDetectionConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// Node-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Human-readable node name.
    pub name: String,
    /// Address this controller is reachable at. The failure-detection
    /// server never marks its own address failed.
    pub listen_addr: SocketAddr,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "keystone-controller".to_string(),
            listen_addr: "127.0.0.1:4500".parse().expect("valid socket address"),
        }
    }
}

/// Recruitment, registry, and master-lifecycle tuning.
///
/// Defaults suit a production cluster; tests and `development()` shrink
/// the long ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerTuning {
    /// Back-off between recruitment attempts.
    #[serde(with = "humantime_serde")]
    pub attempt_recruitment_delay: Duration,
    /// Grace window after startup during which recruitment holds out for
    /// placements at or above the expected fitness targets.
    #[serde(with = "humantime_serde")]
    pub wait_for_good_recruitment_delay: Duration,
    /// Floor between consecutive master recruitments.
    #[serde(with = "humantime_serde")]
    pub master_spin_delay: Duration,
    /// Debounce before each better-master evaluation.
    #[serde(with = "humantime_serde")]
    pub check_better_master_interval: Duration,
    /// Deadline for queued storage-recruitment requests.
    #[serde(with = "humantime_serde")]
    pub recruitment_timeout: Duration,
    /// Continuous unavailability after which a worker is evicted.
    #[serde(with = "humantime_serde")]
    pub worker_failure_time: Duration,
    /// Reboot cooldown: a worker regaining availability is considered
    /// unstable for this long.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Reaction time to master failure once the master has registered.
    #[serde(with = "humantime_serde")]
    pub master_failure_reaction_time: Duration,
    /// Pre-registration reaction time grows linearly with recovery elapsed
    /// time, scaled by this slope.
    pub master_failure_slope_during_recovery: f64,
    /// Interval between coordination pings broadcast to all workers.
    #[serde(with = "humantime_serde")]
    pub worker_coordination_ping_delay: Duration,
    /// Park timeout for client/server info long-polls, jittered.
    #[serde(with = "humantime_serde")]
    pub info_park_timeout: Duration,
    /// Fitness targets enforced during the startup grace window.
    pub expected_master_fitness: Fitness,
    pub expected_log_fitness: Fitness,
    pub expected_proxy_fitness: Fitness,
    pub expected_resolver_fitness: Fitness,
    /// Randomized-search budget for policy-satisfying log teams.
    pub policy_rating_tests: u32,
    pub policy_generations: u32,
    /// Expiry for remembered incompatible peer connections.
    #[serde(with = "humantime_serde")]
    pub incompatible_peer_expiry: Duration,
}

impl Default for ControllerTuning {
    fn default() -> Self {
        Self {
            attempt_recruitment_delay: Duration::from_millis(50),
            wait_for_good_recruitment_delay: Duration::from_secs(1),
            master_spin_delay: Duration::from_secs(1),
            check_better_master_interval: Duration::from_secs(1),
            recruitment_timeout: Duration::from_secs(600),
            worker_failure_time: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(10),
            master_failure_reaction_time: Duration::from_millis(400),
            master_failure_slope_during_recovery: 0.1,
            worker_coordination_ping_delay: Duration::from_secs(60),
            info_park_timeout: Duration::from_millis(300),
            expected_master_fitness: Fitness::UnsetFit,
            expected_log_fitness: Fitness::UnsetFit,
            expected_proxy_fitness: Fitness::UnsetFit,
            expected_resolver_fitness: Fitness::UnsetFit,
            policy_rating_tests: 200,
            policy_generations: 100,
            incompatible_peer_expiry: Duration::from_secs(600),
        }
    }
}

/// Failure-detection server tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureDetectionConfig {
    /// Interval clients are told to poll at; also the server's tick.
    #[serde(with = "humantime_serde")]
    pub client_request_interval: Duration,
    /// Floor added to the adaptive failure threshold.
    #[serde(with = "humantime_serde")]
    pub failure_min_delay: Duration,
    /// Hard ceiling: silence beyond this is failure no matter the pivot.
    #[serde(with = "humantime_serde")]
    pub failure_max_delay: Duration,
    /// Timeout advertised to clients for considering a server failed.
    #[serde(with = "humantime_serde")]
    pub failure_timeout_delay: Duration,
}

impl Default for FailureDetectionConfig {
    fn default() -> Self {
        Self {
            client_request_interval: Duration::from_secs(1),
            failure_min_delay: Duration::from_secs(1),
            failure_max_delay: Duration::from_secs(5),
            failure_timeout_delay: Duration::from_secs(1),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level filter, e.g. `info` or `keystone=debug`.
    pub log_level: String,
    /// Emit JSON-formatted logs.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}
