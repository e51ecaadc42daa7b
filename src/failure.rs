//! Failure-detection server and the shared availability view.
//!
//! Every process in the cluster polls the controller with
//! [`FailureMonitoringRequest`]s. The server keeps a versioned, delta
//! compressed map of per-address status, adapts its failure threshold to
//! the latencies it actually observes, and publishes an availability view
//! that the worker registry and the placement engine consume locally.
//!
//! Clients at a recent version get the changes since their cursor; stale
//! or fresh clients get a full snapshot flagged `all_others_failed` so
//! they reset state they may be carrying for departed peers.

use crate::config::FailureDetectionConfig;
use crate::error::{KeystoneError, Result};
use crate::shutdown::ShutdownCoordinator;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Availability verdict for one address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FailureStatus {
    pub failed: bool,
}

impl FailureStatus {
    pub fn available() -> Self {
        Self { failed: false }
    }

    pub fn failed() -> Self {
        Self { failed: true }
    }
}

/// One monitoring poll from a cluster process.
#[derive(Debug)]
pub struct FailureMonitoringRequest {
    /// Address of the sender.
    pub peer: SocketAddr,
    /// The sender's version cursor; 0 requests a full snapshot.
    pub version: u64,
    /// The sender's claim about its own status, if any.
    pub sender_status: Option<FailureStatus>,
    pub reply: oneshot::Sender<Result<FailureMonitoringReply>>,
}

/// Reply to a monitoring poll.
#[derive(Debug, Clone)]
pub struct FailureMonitoringReply {
    pub version: u64,
    /// Status changes since the requested version, oldest first; or the
    /// full current map when `all_others_failed` is set.
    pub changes: Vec<(SocketAddr, FailureStatus)>,
    /// When set, the client must treat every address absent from `changes`
    /// as failed.
    pub all_others_failed: bool,
    /// Interval the client should poll at.
    pub client_request_interval: Duration,
    /// Timeout after which clients consider an unresponsive server failed.
    pub consider_failed_timeout: Duration,
}

/// Snapshot of which addresses are currently considered failed.
#[derive(Debug, Clone, Default)]
pub struct MonitorState {
    failed: HashSet<SocketAddr>,
}

impl MonitorState {
    pub fn is_available(&self, address: SocketAddr) -> bool {
        !self.failed.contains(&address)
    }

    pub fn failed_addresses(&self) -> impl Iterator<Item = &SocketAddr> {
        self.failed.iter()
    }
}

/// Cloneable handle onto the availability view published by the
/// failure-detection server. Unknown addresses count as available.
#[derive(Clone)]
pub struct FailureMonitor {
    rx: watch::Receiver<MonitorState>,
}

impl FailureMonitor {
    pub fn is_available(&self, address: SocketAddr) -> bool {
        self.rx.borrow().is_available(address)
    }

    pub fn snapshot(&self) -> MonitorState {
        self.rx.borrow().clone()
    }

    /// Wait for the next change to the availability view. Returns false
    /// once the publishing server has gone away; the view is then frozen.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

/// Resolve once `address` has been continuously unavailable for
/// `reaction`. Only regained availability resets the clock; unrelated
/// view changes do not.
pub async fn wait_failure(mut monitor: FailureMonitor, address: SocketAddr, reaction: Duration) {
    loop {
        if monitor.is_available(address) {
            if !monitor.changed().await {
                // Publisher gone: availability can never change again.
                std::future::pending::<()>().await;
            }
            continue;
        }

        let deadline = tokio::time::sleep(reaction);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => return,
                live = monitor.changed() => {
                    if monitor.is_available(address) {
                        break;
                    }
                    if !live {
                        deadline.await;
                        return;
                    }
                }
            }
        }
    }
}

/// Per-address request bookkeeping at the current version.
#[derive(Debug, Clone)]
struct StatusEntry {
    status: FailureStatus,
    last_request: Instant,
    penultimate_request: Option<Instant>,
}

impl StatusEntry {
    fn new(now: Instant) -> Self {
        Self {
            status: FailureStatus::available(),
            last_request: now,
            penultimate_request: None,
        }
    }

    fn insert_request(&mut self, now: Instant) {
        self.penultimate_request = Some(self.last_request);
        self.last_request = now;
    }

    /// Observed latency: the larger of the time since the last request and
    /// the gap between the last two requests.
    fn latency(&self, now: Instant) -> Option<Duration> {
        let penultimate = self.penultimate_request?;
        let since_last = now.saturating_duration_since(self.last_request);
        let gap = self.last_request.saturating_duration_since(penultimate);
        Some(since_last.max(gap))
    }
}

/// The versioned detector state, separated from channel plumbing so the
/// invariants can be exercised directly.
struct DetectorState {
    id: Uuid,
    config: FailureDetectionConfig,
    local_address: SocketAddr,
    current_version: u64,
    current_status: HashMap<SocketAddr, StatusEntry>,
    status_history: VecDeque<(SocketAddr, FailureStatus)>,
    failed: HashSet<SocketAddr>,
}

impl DetectorState {
    fn new(id: Uuid, config: FailureDetectionConfig, local_address: SocketAddr) -> Self {
        Self {
            id,
            config,
            local_address,
            current_version: 0,
            current_status: HashMap::new(),
            status_history: VecDeque::new(),
            failed: HashSet::new(),
        }
    }

    fn record_change(&mut self, address: SocketAddr, status: FailureStatus) {
        self.status_history.push_back((address, status));
        self.current_version += 1;
        if status.failed {
            self.failed.insert(address);
        } else {
            self.failed.remove(&address);
        }
    }

    /// History never outgrows the status map; stale clients fall back to
    /// full snapshots instead.
    fn compact_history(&mut self) {
        while self.status_history.len() > self.current_status.len() {
            self.status_history.pop_front();
        }
    }

    fn handle_request(
        &mut self,
        peer: SocketAddr,
        version: u64,
        sender_status: Option<FailureStatus>,
        now: Instant,
    ) -> Result<FailureMonitoringReply> {
        if let Some(status) = sender_status {
            if status.failed && peer == self.local_address {
                warn!(%peer, "Ignoring self-reported failure for local address");
            } else {
                let known = self.current_status.contains_key(&peer);
                let entry = self
                    .current_status
                    .entry(peer)
                    .or_insert_with(|| StatusEntry::new(now));
                entry.insert_request(now);
                // A brand-new entry is a transition too: the address was
                // either unknown or previously compacted away as failed.
                if !known || entry.status != status {
                    entry.status = status;
                    debug!(detector = %self.id, %peer, failed = status.failed, why = "request", "Failure detection status change");
                    self.record_change(peer, status);
                    self.compact_history();
                }
            }
        }

        if version > self.current_version {
            error!(
                detector = %self.id,
                %peer,
                presented = version,
                current = self.current_version,
                "Monitoring client presented a version from the future"
            );
            return Err(KeystoneError::FutureVersion {
                presented: version,
                current: self.current_version,
            });
        }

        let history_len = self.status_history.len() as u64;
        let oldest_served = self.current_version - history_len;

        let (changes, all_others_failed) = if version == 0 || version < oldest_served {
            let changes = self
                .current_status
                .iter()
                .map(|(addr, entry)| (*addr, entry.status))
                .collect();
            (changes, true)
        } else {
            let start = (version - oldest_served) as usize;
            let changes = self.status_history.iter().skip(start).copied().collect();
            (changes, false)
        };

        Ok(FailureMonitoringReply {
            version: self.current_version,
            changes,
            all_others_failed,
            client_request_interval: self.config.client_request_interval,
            consider_failed_timeout: self.config.failure_timeout_delay,
        })
    }

    /// Periodic sweep: compute the adaptive threshold from observed
    /// latencies and declare silent clients failed.
    fn tick(&mut self, now: Instant) {
        let interval = self.config.client_request_interval;

        let mut delays: Vec<Duration> = self
            .current_status
            .values()
            .filter_map(|entry| entry.latency(now))
            .collect();

        // The second-largest observed latency, less the nominal poll
        // interval, floors at zero: one outlier never drags the whole
        // cluster's threshold up.
        let mut pivot_delay = Duration::ZERO;
        if !delays.is_empty() {
            let pivot = delays.len().saturating_sub(2);
            delays.sort_unstable();
            pivot_delay = delays[pivot].saturating_sub(interval);
        }

        debug!(
            detector = %self.id,
            pivot_ms = pivot_delay.as_millis() as u64,
            clients = self.current_status.len(),
            "Failure detection poll"
        );

        let threshold = pivot_delay * 2 + interval + self.config.failure_min_delay;
        let mut newly_failed = Vec::new();
        for (addr, entry) in &self.current_status {
            if *addr == self.local_address {
                continue;
            }
            let delay = now.saturating_duration_since(entry.last_request);
            if delay > threshold || delay > self.config.failure_max_delay {
                info!(
                    detector = %self.id,
                    peer = %addr,
                    last_request_age_ms = delay.as_millis() as u64,
                    pivot_ms = pivot_delay.as_millis() as u64,
                    why = "timeout",
                    "Declaring address failed"
                );
                newly_failed.push(*addr);
            }
        }

        for addr in newly_failed {
            self.current_status.remove(&addr);
            self.record_change(addr, FailureStatus::failed());
            self.compact_history();
        }
    }

    fn monitor_state(&self) -> MonitorState {
        MonitorState {
            failed: self.failed.clone(),
        }
    }
}

/// The failure-detection server task.
pub struct FailureDetectionServer {
    state: DetectorState,
    requests: mpsc::Receiver<FailureMonitoringRequest>,
    monitor_tx: watch::Sender<MonitorState>,
}

impl FailureDetectionServer {
    /// Build the server and the availability view handle it publishes to.
    pub fn new(
        id: Uuid,
        config: FailureDetectionConfig,
        local_address: SocketAddr,
        requests: mpsc::Receiver<FailureMonitoringRequest>,
    ) -> (Self, FailureMonitor) {
        let (monitor_tx, monitor_rx) = watch::channel(MonitorState::default());
        let server = Self {
            state: DetectorState::new(id, config, local_address),
            requests,
            monitor_tx,
        };
        (server, FailureMonitor { rx: monitor_rx })
    }

    pub async fn run(mut self, shutdown: ShutdownCoordinator) -> Result<()> {
        let mut ticker = tokio::time::interval(self.state.config.client_request_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_tick: Option<Instant> = None;
        let mut shutdown_rx = shutdown.subscribe();

        loop {
            tokio::select! {
                request = self.requests.recv() => {
                    let Some(request) = request else {
                        return Ok(());
                    };
                    let before = self.state.current_version;
                    let reply = self.state.handle_request(
                        request.peer,
                        request.version,
                        request.sender_status,
                        Instant::now(),
                    );
                    if self.state.current_version != before {
                        let _ = self.monitor_tx.send(self.state.monitor_state());
                    }
                    let _ = request.reply.send(reply);
                }
                _ = ticker.tick() => {
                    let now = Instant::now();
                    if let Some(last) = last_tick {
                        let gap = now.saturating_duration_since(last);
                        // A sweep landing over a second past its cadence
                        // means this loop is stalled, not the clients.
                        let late_threshold =
                            self.state.config.client_request_interval + Duration::from_secs(1);
                        if gap > late_threshold {
                            warn!(gap_ms = gap.as_millis() as u64, "Long gap between failure detection sweeps");
                        }
                    }
                    last_tick = Some(now);

                    let before = self.state.current_version;
                    self.state.tick(now);
                    if self.state.current_version != before {
                        let _ = self.monitor_tx.send(self.state.monitor_state());
                    }
                }
                _ = shutdown_rx.recv() => {
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FailureDetectionConfig;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn state() -> DetectorState {
        DetectorState::new(
            Uuid::new_v4(),
            FailureDetectionConfig::default(),
            addr(4500),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_request_is_a_change() {
        let mut s = state();
        let now = Instant::now();

        let reply = s
            .handle_request(addr(1), 0, Some(FailureStatus::available()), now)
            .unwrap();
        assert_eq!(reply.version, 1);
        assert!(reply.all_others_failed);
        assert_eq!(reply.changes.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_status_does_not_bump_version() {
        let mut s = state();
        let now = Instant::now();

        s.handle_request(addr(1), 0, Some(FailureStatus::available()), now)
            .unwrap();
        let reply = s
            .handle_request(addr(1), 1, Some(FailureStatus::available()), now)
            .unwrap();
        assert_eq!(reply.version, 1);
        assert!(!reply.all_others_failed);
        assert!(reply.changes.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delta_reconstructs_current_status() {
        let mut s = state();
        let now = Instant::now();

        // Client A takes a cursor at version 1, then B and C arrive.
        s.handle_request(addr(1), 0, Some(FailureStatus::available()), now)
            .unwrap();
        s.handle_request(addr(2), 0, Some(FailureStatus::available()), now)
            .unwrap();
        s.handle_request(addr(3), 0, Some(FailureStatus::available()), now)
            .unwrap();

        let reply = s.handle_request(addr(1), 1, None, now).unwrap();
        assert!(!reply.all_others_failed);
        assert_eq!(
            reply.changes,
            vec![
                (addr(2), FailureStatus::available()),
                (addr(3), FailureStatus::available())
            ]
        );
        assert_eq!(reply.version, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_cursor_gets_full_snapshot() {
        let mut s = state();
        let now = Instant::now();

        for port in 1..=3 {
            s.handle_request(addr(port), 0, Some(FailureStatus::available()), now)
                .unwrap();
        }
        // Fail every address via tick so the history compacts away and a
        // zero cursor can only be served by snapshot.
        tokio::time::advance(Duration::from_secs(60)).await;
        s.tick(Instant::now());
        assert!(s.current_status.is_empty());
        assert!(s.status_history.is_empty());

        let reply = s.handle_request(addr(9), 0, None, now).unwrap();
        assert!(reply.all_others_failed);
        assert_eq!(reply.version, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_future_version_rejected_without_crash() {
        let mut s = state();
        let now = Instant::now();

        let err = s.handle_request(addr(1), 99, None, now).unwrap_err();
        assert!(matches!(err, KeystoneError::FutureVersion { .. }));
        // Server still serves afterwards.
        s.handle_request(addr(1), 0, Some(FailureStatus::available()), now)
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_bounded_by_status_size() {
        let mut s = state();
        let now = Instant::now();

        for port in 1..=5 {
            s.handle_request(addr(port), 0, Some(FailureStatus::available()), now)
                .unwrap();
        }
        assert!(s.status_history.len() <= s.current_status.len());
        assert!(s.current_version >= s.status_history.len() as u64);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_fails_silent_clients() {
        let mut s = state();
        let start = Instant::now();

        for port in 1..=3 {
            s.handle_request(addr(port), 0, Some(FailureStatus::available()), start)
                .unwrap();
        }
        let v = s.current_version;

        tokio::time::advance(Duration::from_secs(30)).await;
        s.tick(Instant::now());

        assert!(s.current_status.is_empty());
        assert_eq!(s.current_version, v + 3);
        for port in 1..=3 {
            assert!(!s.monitor_state().is_available(addr(port)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_address_never_failed() {
        let mut s = state();
        let local = s.local_address;
        let start = Instant::now();

        s.handle_request(local, 0, Some(FailureStatus::available()), start)
            .unwrap();
        tokio::time::advance(Duration::from_secs(600)).await;
        s.tick(Instant::now());

        assert!(s.current_status.contains_key(&local));
        assert!(s.monitor_state().is_available(local));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pivot_tolerates_one_slow_client() {
        let mut s = state();
        let mut now = Instant::now();

        // Five clients; four poll every second, one lags at 900ms extra.
        for round in 0..5u64 {
            for port in 1..=4 {
                s.handle_request(addr(port), 0, Some(FailureStatus::available()), now)
                    .unwrap();
            }
            if round % 2 == 0 {
                s.handle_request(addr(5), 0, Some(FailureStatus::available()), now)
                    .unwrap();
            }
            tokio::time::advance(Duration::from_secs(1)).await;
            now = Instant::now();
        }

        s.tick(now);
        // The laggard polls at 2s cadence: under the adaptive threshold,
        // above none of the hard limits.
        assert!(s.current_status.contains_key(&addr(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovered_address_becomes_available_again() {
        let mut s = state();
        let start = Instant::now();

        s.handle_request(addr(1), 0, Some(FailureStatus::available()), start)
            .unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        s.tick(Instant::now());
        assert!(!s.monitor_state().is_available(addr(1)));

        let now = Instant::now();
        s.handle_request(addr(1), 0, Some(FailureStatus::available()), now)
            .unwrap();
        assert!(s.monitor_state().is_available(addr(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_failure_requires_sustained_outage() {
        let (tx, rx) = watch::channel(MonitorState::default());
        let monitor = FailureMonitor { rx };
        let target = addr(7);

        let waiter = tokio::spawn(wait_failure(
            monitor.clone(),
            target,
            Duration::from_secs(1),
        ));

        // Flap: fail briefly, recover, then fail for good.
        let mut failed = HashSet::new();
        failed.insert(target);
        tx.send(MonitorState {
            failed: failed.clone(),
        })
        .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(MonitorState::default()).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!waiter.is_finished());

        tx.send(MonitorState { failed }).unwrap();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("failure should be reported")
            .unwrap();
    }
}
