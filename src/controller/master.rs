//! Master lifecycle: recruit, watch, replace.
//!
//! One long-running task drives the state machine
//! `Idle -> Recruiting -> Watching -> (Failed | Preempted) -> Idle`.
//! Recruiting holds out for an expected-fitness master during the startup
//! grace window. Watching reacts to master failure with an adaptive
//! timeout: generous while a recovery is still in flight, sharp once the
//! master has registered. A better-master verdict forces the watching
//! state to exit and recruit again.

use super::ClusterState;
use crate::broadcast::ServerDbInfo;
use crate::error::{KeystoneError, Result};
use crate::failure::wait_failure;
use crate::messages::RecruitMasterRequest;
use crate::types::ClusterRole;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub(crate) async fn watch_database(state: Arc<ClusterState>) -> Result<()> {
    let mut shutdown = state.shutdown.subscribe();
    loop {
        if state.shutdown.is_shutting_down() {
            return Ok(());
        }

        let cycle = run_one_master(&state);
        let outcome = tokio::select! {
            outcome = cycle => outcome,
            _ = shutdown.recv() => return Ok(()),
        };

        match outcome {
            Ok(()) => {}
            Err(KeystoneError::NoMoreServers(reason)) => {
                warn!(
                    controller_id = %state.id,
                    %reason,
                    "No master candidate available, retrying"
                );
                tokio::time::sleep(state.tuning.attempt_recruitment_delay).await;
            }
            Err(e) => {
                warn!(controller_id = %state.id, error = %e, "Master lifecycle failed");
                return Err(e);
            }
        }
    }
}

/// One recruit-and-watch cycle. Returns `Ok(())` when the cycle ended for
/// a reason that should simply restart recruitment.
async fn run_one_master(state: &Arc<ClusterState>) -> Result<()> {
    let recovery_start = Instant::now();
    debug!(controller_id = %state.id, "Recruiting master");

    let (worker, class) = state.master_candidate(false).await?;
    let fitness = class.fitness(ClusterRole::Master);
    if fitness > state.tuning.expected_master_fitness && state.in_grace_window() {
        debug!(
            controller_id = %state.id,
            ?fitness,
            "Master candidate below expected fitness during grace window"
        );
        tokio::time::sleep(state.tuning.attempt_recruitment_delay).await;
        return Ok(());
    }

    *state.master_process.write().await = Some(worker.process_id().clone());

    let lifetime = state.server_info.get().master_lifetime;
    let (reply_tx, reply_rx) = oneshot::channel();
    if worker
        .recruit_master
        .send(RecruitMasterRequest {
            lifetime,
            reply: reply_tx,
        })
        .await
        .is_err()
    {
        warn!(
            controller_id = %state.id,
            process = %worker.process_id(),
            "Master recruitment channel closed"
        );
        tokio::time::sleep(state.tuning.master_spin_delay).await;
        return Ok(());
    }

    let master = tokio::select! {
        reply = reply_rx => match reply {
            Ok(master) => master,
            Err(_) => {
                warn!(
                    controller_id = %state.id,
                    process = %worker.process_id(),
                    "Master recruitment went unanswered"
                );
                tokio::time::sleep(state.tuning.master_spin_delay).await;
                return Ok(());
            }
        },
        _ = wait_failure(state.monitor(), worker.address(), state.tuning.worker_failure_time) => {
            warn!(
                controller_id = %state.id,
                process = %worker.process_id(),
                "Chosen master worker failed before replying"
            );
            tokio::time::sleep(state.tuning.master_spin_delay).await;
            return Ok(());
        }
    };

    info!(
        controller_id = %state.id,
        master_id = %master.id,
        address = %master.address(),
        "Recruited master"
    );

    state.master_registration_count.store(0, Ordering::SeqCst);
    *state.db_config.write().await = None;
    let mut force_failure = state.arm_master_failure();

    let lifetime = lifetime + 1;
    let master_for_info = master.clone();
    let controller_id = state.id;
    state.server_info.publish_with(move |info| {
        // A fresh recruitment resets everything the old master reported.
        let client = info.client.clone();
        *info = ServerDbInfo {
            controller_id,
            master: Some(master_for_info),
            master_lifetime: lifetime,
            client,
            ..Default::default()
        };
    });

    // Floor between recoveries; also spaces out the first one.
    tokio::time::sleep(state.tuning.master_spin_delay).await;

    debug!(controller_id = %state.id, master_id = %master.id, "Watching master");
    let mut info_rx = state.server_info.subscribe();
    info_rx.mark_unchanged();

    loop {
        // Failure detection is sharp once the master has registered; while
        // a recovery is still in flight the window grows with it so a long
        // recovery is not restarted by its own duration.
        let reaction = if state.master_registration_count.load(Ordering::SeqCst) > 0 {
            state.tuning.master_failure_reaction_time
        } else {
            recovery_start
                .elapsed()
                .mul_f64(state.tuning.master_failure_slope_during_recovery)
                .max(state.tuning.master_failure_reaction_time)
        };

        tokio::select! {
            _ = wait_failure(state.monitor(), master.address(), reaction) => {
                warn!(
                    controller_id = %state.id,
                    master_id = %master.id,
                    "Detected failed master"
                );
                return Ok(());
            }
            fired = &mut force_failure => {
                if fired.is_ok() {
                    warn!(
                        controller_id = %state.id,
                        master_id = %master.id,
                        "Master preempted: better placement available"
                    );
                }
                return Ok(());
            }
            changed = info_rx.changed() => {
                // Registration state moved; re-derive the reaction time.
                if changed.is_err() {
                    return Ok(());
                }
            }
        }
    }
}
