//! Request intake: dispatching inbound requests, pending-queue retry, and
//! the periodic coordination ping.
//!
//! The intake is one cooperative loop in the controller core; long-poll
//! requests and full recruitments are handed to short-lived tasks so one
//! parked client never blocks the queue. Any registry or class change
//! funnels through [`check_outstanding_requests`], which retries both
//! pending queues and kicks the better-master evaluation.

use super::{jittered, ClusterState};
use crate::error::{KeystoneError, Result};
use crate::messages::{
    ClusterStatus, ControllerRequest, CoordinationPing, GetServerDbInfoRequest,
    OpenDatabaseRequest, RecruitFromConfigurationRequest, RegisterMasterRequest,
    WorkerStatusEntry,
};
use crate::types::ClassType;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Dispatch one inbound request. Errors returned here are fatal to the
/// controller role.
pub(crate) async fn handle_request(
    state: &Arc<ClusterState>,
    request: ControllerRequest,
    tasks: &mut JoinSet<Result<()>>,
) -> Result<()> {
    match request {
        ControllerRequest::RegisterWorker(request) => {
            state.register_worker(request).await;
        }
        ControllerRequest::RegisterMaster(request) => {
            register_master(state, request).await;
        }
        ControllerRequest::RecruitFromConfiguration(request) => {
            tasks.spawn(recruit_from_configuration(state.clone(), request));
        }
        ControllerRequest::RecruitStorage(request) => {
            match state.recruit_storage(&request).await {
                Ok(reply) => {
                    let _ = request.reply.send(Ok(reply));
                }
                Err(KeystoneError::NoMoreServers(reason)) => {
                    warn!(controller_id = %state.id, %reason, "Storage recruitment waiting for workers");
                    let deadline = Instant::now() + state.tuning.recruitment_timeout;
                    state.pending_storage.lock().await.push((request, deadline));
                }
                Err(e) => return Err(e),
            }
        }
        ControllerRequest::GetWorkers(request) => {
            let workers = state.workers_snapshot().await;
            let filtered = workers
                .into_iter()
                .filter(|(_, class)| {
                    if request.testers_only {
                        class.class_type == ClassType::Tester
                    } else {
                        true
                    }
                })
                .collect();
            let _ = request.reply.send(filtered);
        }
        ControllerRequest::GetClientWorkers { reply } => {
            let workers = state.workers_snapshot().await;
            let handles = workers
                .into_iter()
                .filter(|(_, class)| class.class_type != ClassType::Tester)
                .map(|(worker, _)| worker)
                .collect();
            let _ = reply.send(handles);
        }
        ControllerRequest::GetServerDbInfo(request) => {
            tasks.spawn(serve_server_db_info(state.clone(), request));
        }
        ControllerRequest::OpenDatabase(request) => {
            tasks.spawn(serve_open_database(state.clone(), request));
        }
        ControllerRequest::GetStatus(request) => {
            let _ = request.reply.send(cluster_status(state).await);
        }
        ControllerRequest::Ping { reply } => {
            let _ = reply.send(());
        }
    }
    Ok(())
}

/// Full recruitment with retry. Placement failures either retry after a
/// short delay or, once the startup grace window has passed, park the
/// request on the pending queue until the registry changes.
async fn recruit_from_configuration(
    state: Arc<ClusterState>,
    request: RecruitFromConfigurationRequest,
) -> Result<()> {
    let RecruitFromConfigurationRequest {
        configuration,
        reply,
    } = request;

    loop {
        match state.recruit_from_configuration(&configuration).await {
            Ok(result) => {
                let _ = reply.send(Ok(result));
                return Ok(());
            }
            Err(KeystoneError::NoMoreServers(reason)) if !state.in_grace_window() => {
                warn!(controller_id = %state.id, %reason, "Recruitment waiting for more workers");
                state
                    .pending_recruits
                    .lock()
                    .await
                    .push(RecruitFromConfigurationRequest {
                        configuration,
                        reply,
                    });
                return Ok(());
            }
            Err(e) if e.is_placement() => {
                debug!(controller_id = %state.id, error = %e, "Recruitment attempt failed, retrying");
            }
            Err(e) => {
                warn!(controller_id = %state.id, error = %e, "Recruitment failed fatally");
                return Err(e);
            }
        }
        tokio::time::sleep(state.tuning.attempt_recruitment_delay).await;
    }
}

/// Master registration: gated on the current master's identity and a
/// monotonic registration count, then field-by-field change detection
/// with a single snapshot publish.
pub(crate) async fn register_master(state: &Arc<ClusterState>, request: RegisterMasterRequest) {
    let _ = request.reply.send(());

    info!(
        controller_id = %state.id,
        master_id = %request.master_id,
        registration_count = request.registration_count,
        recovery_state = ?request.recovery_state,
        recovery_count = request.recovery_count,
        logs = request.log_system.logs.len(),
        proxies = request.proxies.len(),
        resolvers = request.resolvers.len(),
        "Master registration received"
    );

    let current = state.server_info.get();
    let is_current_master = current
        .master
        .as_ref()
        .map(|m| m.id == request.master_id)
        .unwrap_or(false);
    let current_count = state.master_registration_count.load(Ordering::SeqCst);
    if !is_current_master || request.registration_count <= current_count {
        debug!(
            controller_id = %state.id,
            master_id = %request.master_id,
            registration_count = request.registration_count,
            current_count,
            "Ignoring out-of-date master registration"
        );
        return;
    }

    state
        .master_registration_count
        .store(request.registration_count, Ordering::SeqCst);
    *state.db_config.write().await = Some(request.configuration);

    let mut changed = false;
    if state.client_info.get().proxies != request.proxies {
        changed = true;
        state
            .client_info
            .publish_with(|client| client.proxies = request.proxies.clone());
    }

    changed |= current.recovery_state != request.recovery_state
        || current.recovery_count != request.recovery_count
        || current.log_system != request.log_system
        || current.resolvers != request.resolvers
        || current.prior_committed_log_workers != request.prior_committed_log_workers;

    if changed {
        let client = state.client_info.get();
        state.server_info.publish_with(move |info| {
            info.recovery_state = request.recovery_state;
            info.recovery_count = request.recovery_count;
            info.log_system = request.log_system;
            info.resolvers = request.resolvers;
            info.prior_committed_log_workers = request.prior_committed_log_workers;
            info.client = client;
        });
    }

    state.trigger_better_master_check();
}

/// Park until the server snapshot moves past the client's known id, or
/// the jittered park timeout expires; then reply with the latest.
async fn serve_server_db_info(
    state: Arc<ClusterState>,
    request: GetServerDbInfoRequest,
) -> Result<()> {
    let issue_id = add_issue(state.id, &state.worker_issues, request.peer, &request.issues).await;
    if !request.incompatible_peers.is_empty() {
        let expiry = Instant::now() + state.tuning.incompatible_peer_expiry;
        let mut incompatible = state.incompatible_peers.write().await;
        for peer in &request.incompatible_peers {
            incompatible.insert(*peer, expiry);
        }
    }

    let park = {
        let mut rng = state.rng.lock();
        jittered(state.tuning.info_park_timeout, &mut rng)
    };
    let mut rx = state.server_info.subscribe();
    let _ = tokio::time::timeout(park, async {
        loop {
            if rx.borrow_and_update().id != request.known_id {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    })
    .await;

    remove_issue(&state.worker_issues, request.peer, issue_id).await;

    debug!(peer = %request.peer, "Sending server info");
    let _ = request.reply.send(state.server_info.get());
    Ok(())
}

/// The client-facing twin of [`serve_server_db_info`].
async fn serve_open_database(state: Arc<ClusterState>, request: OpenDatabaseRequest) -> Result<()> {
    let issue_id = add_issue(state.id, &state.client_issues, request.peer, &request.issues).await;

    let park = {
        let mut rng = state.rng.lock();
        jittered(state.tuning.info_park_timeout, &mut rng)
    };
    let mut rx = state.client_info.subscribe();
    let _ = tokio::time::timeout(park, async {
        loop {
            if rx.borrow_and_update().id != request.known_id {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    })
    .await;

    remove_issue(&state.client_issues, request.peer, issue_id).await;

    let _ = request.reply.send(state.client_info.get());
    Ok(())
}

type IssuesMap = tokio::sync::RwLock<std::collections::HashMap<SocketAddr, (String, Uuid)>>;

async fn add_issue(
    controller_id: Uuid,
    issues: &IssuesMap,
    peer: SocketAddr,
    reported: &[String],
) -> Option<Uuid> {
    if reported.is_empty() {
        issues.write().await.remove(&peer);
        return None;
    }
    let id = Uuid::new_v4();
    let joined = reported.join(",");
    debug!(%controller_id, %peer, issues = %joined, "Recorded reported issues");
    issues.write().await.insert(peer, (joined, id));
    Some(id)
}

async fn remove_issue(issues: &IssuesMap, peer: SocketAddr, issue_id: Option<Uuid>) {
    let Some(issue_id) = issue_id else { return };
    let mut issues = issues.write().await;
    if let Some((_, current)) = issues.get(&peer) {
        if *current == issue_id {
            issues.remove(&peer);
        }
    }
}

/// The controller's own cluster summary; deep status generation lives in
/// an external collector.
pub(crate) async fn cluster_status(state: &Arc<ClusterState>) -> ClusterStatus {
    let monitor = state.monitor();
    let workers = {
        let workers = state.workers.read().await;
        workers
            .values()
            .map(|info| WorkerStatusEntry {
                process: info.worker.process_id().clone(),
                address: info.worker.address(),
                class: info.process_class,
                reboots: info.reboots,
                available: monitor.is_available(info.worker.address()),
            })
            .collect()
    };

    let incompatible_peers = {
        let now = Instant::now();
        let mut incompatible = state.incompatible_peers.write().await;
        incompatible.retain(|_, expiry| *expiry > now);
        incompatible.keys().copied().collect()
    };

    let collect_issues = |map: &std::collections::HashMap<SocketAddr, (String, Uuid)>| {
        map.iter()
            .map(|(peer, (issue, _))| (*peer, issue.clone()))
            .collect::<Vec<_>>()
    };

    let info = state.server_info.get();
    ClusterStatus {
        controller_id: state.id,
        generated_at: chrono::Utc::now(),
        workers,
        master: info.master,
        recovery_state: info.recovery_state,
        worker_issues: collect_issues(&*state.worker_issues.read().await),
        client_issues: collect_issues(&*state.client_issues.read().await),
        incompatible_peers,
    }
}

/// Broadcast the coordination ping to every registered worker.
pub(crate) async fn broadcast_coordination_ping(state: &Arc<ClusterState>, step: u64) {
    let message = CoordinationPing {
        controller_id: state.id,
        step,
    };
    let workers = state.workers_snapshot().await;
    for (worker, _) in &workers {
        let _ = worker.coordination.try_send(message);
    }
    debug!(controller_id = %state.id, step, workers = workers.len(), "Coordination ping sent");
}

/// Retry everything parked on registry change: both pending queues, then
/// the better-master evaluation.
pub(crate) async fn check_outstanding_requests(state: &Arc<ClusterState>) {
    check_outstanding_recruitments(state).await;
    check_outstanding_storage(state).await;
    state.trigger_better_master_check();
}

async fn check_outstanding_recruitments(state: &Arc<ClusterState>) {
    let parked: Vec<RecruitFromConfigurationRequest> = {
        let mut queue = state.pending_recruits.lock().await;
        queue.drain(..).collect()
    };
    if parked.is_empty() {
        return;
    }

    let mut keep = Vec::new();
    for request in parked {
        match state.recruit_from_configuration(&request.configuration).await {
            Ok(reply) => {
                let _ = request.reply.send(Ok(reply));
            }
            Err(e) if e.is_placement() => {
                debug!(controller_id = %state.id, error = %e, "Parked recruitment still waiting");
                keep.push(request);
            }
            Err(e) => {
                keep.push(request);
                state.report_fatal(e);
            }
        }
    }
    state.pending_recruits.lock().await.extend(keep);
}

async fn check_outstanding_storage(state: &Arc<ClusterState>) {
    let parked: Vec<_> = {
        let mut queue = state.pending_storage.lock().await;
        queue.drain(..).collect()
    };
    if parked.is_empty() {
        return;
    }

    let now = Instant::now();
    let mut keep = Vec::new();
    for (request, deadline) in parked {
        if deadline <= now {
            let _ = request
                .reply
                .send(Err(KeystoneError::Timeout(state.tuning.recruitment_timeout)));
            continue;
        }
        match state.recruit_storage(&request).await {
            Ok(reply) => {
                let _ = request.reply.send(Ok(reply));
            }
            Err(KeystoneError::NoMoreServers(_)) => {
                keep.push((request, deadline));
            }
            Err(e) => {
                keep.push((request, deadline));
                state.report_fatal(e);
            }
        }
    }
    state.pending_storage.lock().await.extend(keep);
}

/// Debounced, non-reentrant better-master evaluation. Wakes on triggers
/// from registration and availability changes, and on its own periodic
/// tick; each wake waits out the debounce interval before evaluating so
/// bursts of registrations coalesce into one check.
pub(crate) async fn better_master_checker(state: Arc<ClusterState>) -> Result<()> {
    let mut shutdown = state.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = state.better_master_check.notified() => {}
            _ = tokio::time::sleep(state.tuning.check_better_master_interval) => {}
            _ = shutdown.recv() => return Ok(()),
        }
        tokio::select! {
            _ = tokio::time::sleep(state.tuning.check_better_master_interval) => {}
            _ = shutdown.recv() => return Ok(()),
        }

        if state.better_master_exists().await && state.fire_master_failure() {
            let master = state.server_info.get().master;
            info!(
                controller_id = %state.id,
                master_id = ?master.map(|m| m.id),
                "Forcing master replacement"
            );
        }
    }
}
