//! Role placement: selecting workers for storage, logs, proxies,
//! resolvers, and the master.
//!
//! Selection combines the class fitness ordering (lower is better,
//! `NeverAssign` disqualifies), per-process usage counts that spread roles
//! across processes, and the configured replication policy over log-team
//! localities. Ties break by reservoir sampling on the single shared RNG,
//! so placement is deterministic under a fixed seed.
//!
//! The engine is pure over a candidate snapshot; the [`ClusterState`]
//! methods at the bottom assemble snapshots from the registry and the
//! availability view.

use super::ClusterState;
use crate::config::ControllerTuning;
use crate::error::{KeystoneError, Result};
use crate::messages::{
    RecruitFromConfigurationReply, RecruitStorageReply, RecruitStorageRequest, WorkerHandle,
};
use crate::policy::find_best_policy_set;
use crate::types::{
    ClusterRole, DatabaseConfiguration, DcId, Fitness, Locality, ProcessClass, ProcessId,
    RecoveryState, ZoneId,
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, info};

pub(crate) fn no_more_servers(reason: impl Into<String>) -> KeystoneError {
    KeystoneError::NoMoreServers(reason.into())
}

/// One worker as seen by a single placement evaluation.
#[derive(Debug, Clone)]
pub(crate) struct Candidate {
    pub worker: WorkerHandle,
    pub class: ProcessClass,
    pub reboots: u32,
    pub available: bool,
}

impl Candidate {
    /// `check_stable` additionally treats recently rebooted workers as
    /// unavailable.
    fn usable(&self, check_stable: bool) -> bool {
        self.available && (!check_stable || self.reboots < 2)
    }

    fn process(&self) -> &ProcessId {
        self.worker.process_id()
    }

    fn dc(&self) -> Option<&DcId> {
        self.worker.locality.dc.as_ref()
    }

    fn fitness(&self, role: ClusterRole) -> Fitness {
        self.class.fitness(role)
    }
}

/// A selected worker along with the fitness bucket it was taken from,
/// used as the lower bound when filling out the rest of a role.
#[derive(Debug, Clone)]
pub(crate) struct RoleFit {
    pub worker: WorkerHandle,
    pub class: ProcessClass,
    pub fitness: Fitness,
    pub used: usize,
}

/// Fitness summary of a log team: worst member fitness, then size
/// (larger is better).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LogTeamFitness {
    pub fitness: Fitness,
    pub count: usize,
}

impl LogTeamFitness {
    pub fn of(team: &[(WorkerHandle, ProcessClass)]) -> Self {
        Self::of_classes(&team.iter().map(|(_, c)| *c).collect::<Vec<_>>())
    }

    pub fn of_classes(classes: &[ProcessClass]) -> Self {
        let fitness = classes
            .iter()
            .map(|c| c.fitness(ClusterRole::TransactionLog))
            .fold(Fitness::Best, |a, b| a.max(b));
        Self {
            fitness,
            count: classes.len(),
        }
    }
}

impl Ord for LogTeamFitness {
    fn cmp(&self, other: &Self) -> Ordering {
        self.fitness
            .cmp(&other.fitness)
            .then(other.count.cmp(&self.count))
    }
}

impl PartialOrd for LogTeamFitness {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Fitness summary of one datacenter's proxies and resolvers: worst of
/// the two role fitnesses, then the better one, then counts (larger is
/// better).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TxnSystemFitness {
    pub max_fitness: Fitness,
    pub min_fitness: Fitness,
    pub proxy_count: usize,
    pub resolver_count: usize,
}

impl TxnSystemFitness {
    pub fn of(
        proxies: &[(WorkerHandle, ProcessClass)],
        resolvers: &[(WorkerHandle, ProcessClass)],
    ) -> Self {
        let proxy_classes: Vec<ProcessClass> = proxies.iter().map(|(_, c)| *c).collect();
        let resolver_classes: Vec<ProcessClass> = resolvers.iter().map(|(_, c)| *c).collect();
        Self::of_classes(&proxy_classes, &resolver_classes)
    }

    pub fn of_classes(proxy_classes: &[ProcessClass], resolver_classes: &[ProcessClass]) -> Self {
        let proxy_fitness = proxy_classes
            .iter()
            .map(|c| c.fitness(ClusterRole::Proxy))
            .fold(Fitness::Best, |a, b| a.max(b));
        let resolver_fitness = resolver_classes
            .iter()
            .map(|c| c.fitness(ClusterRole::Resolver))
            .fold(Fitness::Best, |a, b| a.max(b));
        Self::from_parts(
            proxy_fitness,
            resolver_fitness,
            proxy_classes.len(),
            resolver_classes.len(),
        )
    }

    pub fn from_parts(
        proxy_fitness: Fitness,
        resolver_fitness: Fitness,
        proxy_count: usize,
        resolver_count: usize,
    ) -> Self {
        Self {
            max_fitness: proxy_fitness.max(resolver_fitness),
            min_fitness: proxy_fitness.min(resolver_fitness),
            proxy_count,
            resolver_count,
        }
    }
}

impl Ord for TxnSystemFitness {
    fn cmp(&self, other: &Self) -> Ordering {
        self.max_fitness
            .cmp(&other.max_fitness)
            .then(self.min_fitness.cmp(&other.min_fitness))
            .then(other.proxy_count.cmp(&self.proxy_count))
            .then(other.resolver_count.cmp(&self.resolver_count))
    }
}

impl PartialOrd for TxnSystemFitness {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Pure placement over one candidate snapshot.
pub(crate) struct PlacementEngine<'a> {
    candidates: &'a [Candidate],
    tuning: &'a ControllerTuning,
    rng: &'a mut StdRng,
}

impl<'a> PlacementEngine<'a> {
    pub fn new(
        candidates: &'a [Candidate],
        tuning: &'a ControllerTuning,
        rng: &'a mut StdRng,
    ) -> Self {
        Self {
            candidates,
            tuning,
            rng,
        }
    }

    /// One worker suitable for storage: any available worker at or above
    /// unset fitness, honoring the request's exclusions. Critical
    /// recruitment relaxes to the best available fitness.
    pub fn storage_worker(
        &mut self,
        exclude_zones: &HashSet<ZoneId>,
        exclude_dcs: &HashSet<DcId>,
        exclude_addresses: &HashSet<SocketAddr>,
        critical: bool,
    ) -> Result<(WorkerHandle, ProcessClass)> {
        let excluded = |c: &Candidate| {
            exclude_zones.contains(&c.worker.locality.zone)
                || c.dc().map(|dc| exclude_dcs.contains(dc)).unwrap_or(false)
                || exclude_addresses.contains(&c.worker.address())
        };

        for candidate in self.candidates {
            if candidate.usable(false)
                && !excluded(candidate)
                && candidate.fitness(ClusterRole::Storage) <= Fitness::UnsetFit
            {
                return Ok((candidate.worker.clone(), candidate.class));
            }
        }

        if critical {
            let mut best: Option<&Candidate> = None;
            let mut best_fitness = Fitness::NeverAssign;
            for candidate in self.candidates {
                let fitness = candidate.fitness(ClusterRole::Storage);
                if candidate.usable(false) && !excluded(candidate) && fitness < best_fitness {
                    best = Some(candidate);
                    best_fitness = fitness;
                }
            }
            if let Some(candidate) = best {
                return Ok((candidate.worker.clone(), candidate.class));
            }
        }

        Err(no_more_servers("no worker fit for storage"))
    }

    /// Strictly best master fitness; equals break by reservoir sampling.
    pub fn master_worker(&mut self, check_stable: bool) -> Result<(WorkerHandle, ProcessClass)> {
        let mut best: Option<&Candidate> = None;
        let mut best_fitness = Fitness::NeverAssign;
        let mut equivalent = 1usize;

        for candidate in self.candidates {
            if !candidate.usable(check_stable) {
                continue;
            }
            let fitness = candidate.fitness(ClusterRole::Master);
            if fitness < best_fitness {
                best = Some(candidate);
                best_fitness = fitness;
                equivalent = 1;
            } else if fitness != Fitness::NeverAssign && fitness == best_fitness {
                equivalent += 1;
                if self.rng.gen::<f64>() < 1.0 / equivalent as f64 {
                    best = Some(candidate);
                }
            }
        }

        best.map(|c| (c.worker.clone(), c.class))
            .ok_or_else(|| no_more_servers("no worker fit for master"))
    }

    /// The log team: accumulate candidates from best fitness downwards
    /// until a policy-satisfying team of the right size exists.
    pub fn transaction_logs(
        &mut self,
        conf: &DatabaseConfiguration,
        id_used: &mut HashMap<ProcessId, usize>,
        check_stable: bool,
    ) -> Result<Vec<(WorkerHandle, ProcessClass)>> {
        let mut by_fitness: BTreeMap<Fitness, Vec<&Candidate>> = BTreeMap::new();
        for candidate in self.candidates {
            let fitness = candidate.fitness(ClusterRole::TransactionLog);
            if candidate.usable(check_stable)
                && !conf.is_excluded(&candidate.worker.address())
                && fitness != Fitness::NeverAssign
            {
                by_fitness.entry(fitness).or_default().push(candidate);
            } else {
                debug!(
                    process = %candidate.process(),
                    zone = %candidate.worker.locality.zone,
                    available = candidate.available,
                    reboots = candidate.reboots,
                    excluded = conf.is_excluded(&candidate.worker.address()),
                    ?fitness,
                    "Log candidate not usable"
                );
            }
        }

        let mut selected: Vec<&Candidate> = Vec::new();
        let mut localities: Vec<Locality> = Vec::new();

        for (fitness, group) in &by_fitness {
            for &candidate in group {
                selected.push(candidate);
                localities.push(candidate.worker.locality.clone());
            }

            if selected.len() < conf.log_replication_factor {
                debug!(
                    ?fitness,
                    accumulated = selected.len(),
                    replication = conf.log_replication_factor,
                    "Too few log candidates at this fitness"
                );
                continue;
            }

            if selected.len() <= conf.desired_logs() {
                if conf.log_policy.validate(&localities) {
                    return Ok(self.commit_log_team(&selected, id_used));
                }
                debug!(
                    ?fitness,
                    accumulated = selected.len(),
                    policy = %conf.log_policy.name(),
                    "Accumulated log candidates do not satisfy policy"
                );
                continue;
            }

            // More candidates than desired: search for the best
            // policy-satisfying subset of the desired size.
            if let Some(indices) = find_best_policy_set(
                &localities,
                conf.log_policy.as_ref(),
                conf.desired_logs(),
                self.tuning.policy_rating_tests,
                self.tuning.policy_generations,
                &mut *self.rng,
            ) {
                let subset: Vec<&Candidate> = indices.iter().map(|&i| selected[i]).collect();
                return Ok(self.commit_log_team(&subset, id_used));
            }
            debug!(
                ?fitness,
                accumulated = selected.len(),
                policy = %conf.log_policy.name(),
                "No policy-satisfying subset of desired size"
            );
        }

        Err(no_more_servers(format!(
            "no log team of {} satisfying {} among {} candidates",
            conf.log_replication_factor,
            conf.log_policy.name(),
            selected.len()
        )))
    }

    fn commit_log_team(
        &mut self,
        team: &[&Candidate],
        id_used: &mut HashMap<ProcessId, usize>,
    ) -> Vec<(WorkerHandle, ProcessClass)> {
        for candidate in team {
            *id_used.entry(candidate.process().clone()).or_default() += 1;
        }
        team.iter()
            .map(|c| (c.worker.clone(), c.class))
            .collect()
    }

    /// One worker for a role, preferring the given datacenter, bucketed by
    /// (fitness, usage) and random within the best bucket. Falls back to
    /// other datacenters when the preferred one has no candidates.
    pub fn worker_for_role_in_dc(
        &mut self,
        dc: Option<&DcId>,
        role: ClusterRole,
        conf: &DatabaseConfiguration,
        id_used: &mut HashMap<ProcessId, usize>,
        check_stable: bool,
    ) -> Result<RoleFit> {
        for same_dc in [true, false] {
            let mut buckets: BTreeMap<(Fitness, usize), Vec<&Candidate>> = BTreeMap::new();
            for candidate in self.candidates {
                let fitness = candidate.fitness(role);
                if candidate.usable(check_stable)
                    && !conf.is_excluded(&candidate.worker.address())
                    && fitness != Fitness::NeverAssign
                    && ((candidate.dc() == dc) == same_dc)
                {
                    let used = id_used.get(candidate.process()).copied().unwrap_or(0);
                    buckets.entry((fitness, used)).or_default().push(candidate);
                }
            }

            if let Some(((fitness, used), mut group)) = buckets.into_iter().next() {
                group.shuffle(&mut *self.rng);
                let candidate = group[0];
                *id_used.entry(candidate.process().clone()).or_default() += 1;
                return Ok(RoleFit {
                    worker: candidate.worker.clone(),
                    class: candidate.class,
                    fitness,
                    used,
                });
            }
        }

        Err(no_more_servers(format!("no worker for role {:?}", role)))
    }

    /// Up to `amount` further workers for a role in one datacenter, never
    /// worse than `min_worker` and never `min_worker` itself. Returns
    /// fewer than `amount` silently when supply runs out.
    pub fn workers_for_role_in_dc(
        &mut self,
        dc: Option<&DcId>,
        role: ClusterRole,
        amount: usize,
        conf: &DatabaseConfiguration,
        id_used: &mut HashMap<ProcessId, usize>,
        min_worker: &RoleFit,
        check_stable: bool,
    ) -> Vec<(WorkerHandle, ProcessClass)> {
        let mut results = Vec::new();
        if amount == 0 {
            return results;
        }

        let mut buckets: BTreeMap<(Fitness, usize), Vec<&Candidate>> = BTreeMap::new();
        for candidate in self.candidates {
            let fitness = candidate.fitness(role);
            let used = id_used.get(candidate.process()).copied().unwrap_or(0);
            let not_worse = fitness < min_worker.fitness
                || (fitness == min_worker.fitness && used <= min_worker.used);
            if candidate.usable(check_stable)
                && !conf.is_excluded(&candidate.worker.address())
                && candidate.worker.id != min_worker.worker.id
                && not_worse
                && candidate.dc() == dc
            {
                buckets.entry((fitness, used)).or_default().push(candidate);
            }
        }

        for (_, mut group) in buckets {
            group.shuffle(&mut *self.rng);
            for candidate in group {
                *id_used.entry(candidate.process().clone()).or_default() += 1;
                results.push((candidate.worker.clone(), candidate.class));
                if results.len() == amount {
                    return results;
                }
            }
        }

        results
    }

    /// Datacenters with at least one usable, non-excluded worker.
    pub fn datacenters(
        &self,
        conf: &DatabaseConfiguration,
        check_stable: bool,
    ) -> Vec<Option<DcId>> {
        let set: BTreeSet<Option<DcId>> = self
            .candidates
            .iter()
            .filter(|c| c.usable(check_stable) && !conf.is_excluded(&c.worker.address()))
            .map(|c| c.dc().cloned())
            .collect();
        set.into_iter().collect()
    }

    /// Full recruitment for a configuration: the log team across
    /// datacenters, then the best single datacenter's proxies and
    /// resolvers. Inside the startup grace window, results below the
    /// expected fitness targets fail with `OperationFailed` so the caller
    /// retries once better workers have had a chance to register.
    pub fn find_workers_for_configuration(
        &mut self,
        conf: &DatabaseConfiguration,
        master_process: Option<&ProcessId>,
        uptime: Duration,
    ) -> Result<RecruitFromConfigurationReply> {
        let mut id_used: HashMap<ProcessId, usize> = HashMap::new();
        if let Some(process) = master_process {
            id_used.insert(process.clone(), 1);
        }

        let logs = self.transaction_logs(conf, &mut id_used, false)?;

        let mut best: Option<TxnSystemFitness> = None;
        let mut best_proxies: Vec<(WorkerHandle, ProcessClass)> = Vec::new();
        let mut best_resolvers: Vec<(WorkerHandle, ProcessClass)> = Vec::new();
        let mut equivalent = 1usize;

        for dc in self.datacenters(conf, false) {
            let mut used = id_used.clone();
            let first_resolver = self.worker_for_role_in_dc(
                dc.as_ref(),
                ClusterRole::Resolver,
                conf,
                &mut used,
                false,
            )?;
            let first_proxy = self.worker_for_role_in_dc(
                dc.as_ref(),
                ClusterRole::Proxy,
                conf,
                &mut used,
                false,
            )?;

            let mut proxies = self.workers_for_role_in_dc(
                dc.as_ref(),
                ClusterRole::Proxy,
                conf.desired_proxies() - 1,
                conf,
                &mut used,
                &first_proxy,
                false,
            );
            let mut resolvers = self.workers_for_role_in_dc(
                dc.as_ref(),
                ClusterRole::Resolver,
                conf.desired_resolvers() - 1,
                conf,
                &mut used,
                &first_resolver,
                false,
            );
            proxies.push((first_proxy.worker.clone(), first_proxy.class));
            resolvers.push((first_resolver.worker.clone(), first_resolver.class));

            let fitness = TxnSystemFitness::of(&proxies, &resolvers);
            let take = match best {
                None => true,
                Some(current) if fitness < current => {
                    equivalent = 1;
                    true
                }
                Some(current) if fitness == current => {
                    equivalent += 1;
                    self.rng.gen::<f64>() < 1.0 / equivalent as f64
                }
                _ => false,
            };
            if take {
                best = Some(fitness);
                best_proxies = proxies;
                best_resolvers = resolvers;
            }
        }

        let best = best.ok_or_else(|| no_more_servers("no datacenter with proxy and resolver"))?;

        debug!(
            replication = conf.log_replication_factor,
            desired_logs = conf.desired_logs(),
            actual_logs = logs.len(),
            desired_proxies = conf.desired_proxies(),
            actual_proxies = best_proxies.len(),
            desired_resolvers = conf.desired_resolvers(),
            actual_resolvers = best_resolvers.len(),
            "Recruitment placement complete"
        );

        if uptime < self.tuning.wait_for_good_recruitment_delay {
            let log_team = LogTeamFitness::of(&logs);
            let expected_logs = LogTeamFitness {
                fitness: self.tuning.expected_log_fitness,
                count: conf.desired_logs(),
            };
            let expected_txn = TxnSystemFitness::from_parts(
                self.tuning.expected_proxy_fitness,
                self.tuning.expected_resolver_fitness,
                conf.desired_proxies(),
                conf.desired_resolvers(),
            );
            if log_team > expected_logs || best > expected_txn {
                debug!(
                    log_fitness = ?log_team.fitness,
                    txn_fitness = ?best,
                    "Holding out for better placement during grace window"
                );
                return Err(KeystoneError::OperationFailed);
            }
        }

        Ok(RecruitFromConfigurationReply {
            logs: logs.into_iter().map(|(w, _)| w).collect(),
            proxies: best_proxies.into_iter().map(|(w, _)| w).collect(),
            resolvers: best_resolvers.into_iter().map(|(w, _)| w).collect(),
        })
    }
}

impl ClusterState {
    /// Snapshot every registered worker with its availability.
    pub(crate) async fn placement_candidates(&self) -> Vec<Candidate> {
        let monitor = self.monitor();
        let workers = self.workers.read().await;
        workers
            .values()
            .map(|info| Candidate {
                worker: info.worker.clone(),
                class: info.process_class,
                reboots: info.reboots,
                available: monitor.is_available(info.worker.address()),
            })
            .collect()
    }

    /// Storage recruitment. Requests before the first process-class read
    /// fail soft unless the recruitment is critical.
    pub async fn recruit_storage(
        &self,
        request: &RecruitStorageRequest,
    ) -> Result<RecruitStorageReply> {
        if !self.got_process_classes() && !request.critical_recruitment {
            return Err(no_more_servers("process classes not yet loaded"));
        }

        let candidates = self.placement_candidates().await;
        let exclude_zones: HashSet<ZoneId> = request.exclude_machines.iter().cloned().collect();
        let exclude_dcs: HashSet<DcId> = request.exclude_dcs.iter().cloned().collect();
        let exclude_addresses: HashSet<SocketAddr> =
            request.exclude_addresses.iter().copied().collect();

        let mut rng = self.rng.lock();
        let mut engine = PlacementEngine::new(&candidates, &self.tuning, &mut rng);
        let (worker, class) = engine.storage_worker(
            &exclude_zones,
            &exclude_dcs,
            &exclude_addresses,
            request.critical_recruitment,
        )?;
        Ok(RecruitStorageReply { worker, class })
    }

    /// Full transaction-subsystem recruitment for a configuration.
    pub async fn recruit_from_configuration(
        &self,
        conf: &DatabaseConfiguration,
    ) -> Result<RecruitFromConfigurationReply> {
        let candidates = self.placement_candidates().await;
        let master_process = self.master_process.read().await.clone();
        let uptime = self.uptime();

        let mut rng = self.rng.lock();
        let mut engine = PlacementEngine::new(&candidates, &self.tuning, &mut rng);
        engine.find_workers_for_configuration(conf, master_process.as_ref(), uptime)
    }

    pub(crate) async fn master_candidate(
        &self,
        check_stable: bool,
    ) -> Result<(WorkerHandle, ProcessClass)> {
        let candidates = self.placement_candidates().await;
        let mut rng = self.rng.lock();
        PlacementEngine::new(&candidates, &self.tuning, &mut rng).master_worker(check_stable)
    }

    /// Would replacing the master strictly improve the deployment?
    ///
    /// Compares the incumbent placement against a fresh evaluation with
    /// `check_stable` set. Any incumbent whose worker is missing from the
    /// registry vetoes preemption: partial information must not churn the
    /// master.
    pub(crate) async fn better_master_exists(&self) -> bool {
        let info = self.server_info.get();
        let Some(master) = info.master.clone() else {
            return false;
        };

        let (old_master_fitness, log_classes, proxy_classes, resolver_classes) = {
            let workers = self.workers.read().await;
            let Some(master_info) = workers.get(&master.locality.process) else {
                return false;
            };
            let old_master_fitness = master_info.process_class.fitness(ClusterRole::Master);

            let mut log_classes = Vec::with_capacity(info.log_system.logs.len());
            for log in &info.log_system.logs {
                match workers.get(log.process_id()) {
                    Some(w) => log_classes.push(w.process_class),
                    None => return false,
                }
            }
            let mut proxy_classes = Vec::with_capacity(info.client.proxies.len());
            for proxy in &info.client.proxies {
                match workers.get(proxy.process_id()) {
                    Some(w) => proxy_classes.push(w.process_class),
                    None => return false,
                }
            }
            let mut resolver_classes = Vec::with_capacity(info.resolvers.len());
            for resolver in &info.resolvers {
                match workers.get(resolver.process_id()) {
                    Some(w) => resolver_classes.push(w.process_class),
                    None => return false,
                }
            }
            (
                old_master_fitness,
                log_classes,
                proxy_classes,
                resolver_classes,
            )
        };

        let Some(conf) = self.db_config.read().await.clone() else {
            return false;
        };
        let candidates = self.placement_candidates().await;
        let master_process = self.master_process.read().await.clone();

        let mut rng = self.rng.lock();
        let mut engine = PlacementEngine::new(&candidates, &self.tuning, &mut rng);

        let mut id_used: HashMap<ProcessId, usize> = HashMap::new();
        if let Some(process) = &master_process {
            id_used.insert(process.clone(), 1);
        }

        let new_master_fitness = match engine.master_worker(true) {
            Ok((_, class)) => class.fitness(ClusterRole::Master),
            Err(_) => return false,
        };

        if info.recovery_state < RecoveryState::FullyRecovered {
            if old_master_fitness > new_master_fitness {
                info!(
                    controller_id = %self.id,
                    ?old_master_fitness,
                    ?new_master_fitness,
                    "Better master exists before full recovery"
                );
                return true;
            }
            return false;
        }

        if old_master_fitness < new_master_fitness {
            return false;
        }

        let old_across = LogTeamFitness::of_classes(&log_classes);
        let new_logs = match engine.transaction_logs(&conf, &mut id_used, true) {
            Ok(logs) => logs,
            Err(_) => return false,
        };
        let new_across = LogTeamFitness::of(&new_logs);
        if old_across < new_across {
            return false;
        }

        let old_in = TxnSystemFitness::of_classes(&proxy_classes, &resolver_classes);
        let mut new_in: Option<TxnSystemFitness> = None;
        for dc in engine.datacenters(&conf, true) {
            let mut used = id_used.clone();
            let Ok(first_resolver) = engine.worker_for_role_in_dc(
                dc.as_ref(),
                ClusterRole::Resolver,
                &conf,
                &mut used,
                true,
            ) else {
                continue;
            };
            let Ok(first_proxy) = engine.worker_for_role_in_dc(
                dc.as_ref(),
                ClusterRole::Proxy,
                &conf,
                &mut used,
                true,
            ) else {
                continue;
            };
            let mut proxies = engine.workers_for_role_in_dc(
                dc.as_ref(),
                ClusterRole::Proxy,
                conf.desired_proxies() - 1,
                &conf,
                &mut used,
                &first_proxy,
                true,
            );
            let mut resolvers = engine.workers_for_role_in_dc(
                dc.as_ref(),
                ClusterRole::Resolver,
                conf.desired_resolvers() - 1,
                &conf,
                &mut used,
                &first_resolver,
                true,
            );
            proxies.push((first_proxy.worker.clone(), first_proxy.class));
            resolvers.push((first_resolver.worker.clone(), first_resolver.class));

            let fitness = TxnSystemFitness::of(&proxies, &resolvers);
            new_in = Some(match new_in {
                Some(current) if current <= fitness => current,
                _ => fitness,
            });
        }
        let Some(new_in) = new_in else {
            return false;
        };
        if old_in < new_in {
            return false;
        }

        if old_master_fitness > new_master_fitness
            || old_across > new_across
            || old_in > new_in
        {
            info!(
                controller_id = %self.id,
                ?old_master_fitness,
                ?new_master_fitness,
                old_log_fitness = ?old_across.fitness,
                new_log_fitness = ?new_across.fitness,
                old_txn_fitness = ?old_in,
                new_txn_fitness = ?new_in,
                "Better master exists"
            );
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{LocalityDimension, PolicyAcross};
    use crate::types::{ClassSource, ClassType};
    use rand::SeedableRng;
    use std::sync::Arc;

    fn candidate(process: &str, zone: &str, port: u16, class_type: ClassType) -> Candidate {
        let address: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
        let (worker, _channels) = WorkerHandle::new(Locality::new(process, zone, address));
        Candidate {
            worker,
            class: ProcessClass::new(class_type, ClassSource::CommandLine),
            reboots: 0,
            available: true,
        }
    }

    fn tuning() -> ControllerTuning {
        ControllerTuning::default()
    }

    fn conf(replication: usize, desired_logs: usize) -> DatabaseConfiguration {
        DatabaseConfiguration {
            log_replication_factor: replication,
            desired_logs,
            desired_proxies: 1,
            desired_resolvers: 1,
            log_policy: Arc::new(PolicyAcross::new(replication, LocalityDimension::Zone)),
            ..Default::default()
        }
    }

    #[test]
    fn test_storage_worker_honors_zone_exclusion() {
        let candidates = vec![
            candidate("p1", "z1", 1, ClassType::Storage),
            candidate("p2", "z1", 2, ClassType::Storage),
            candidate("p3", "z2", 3, ClassType::Storage),
        ];
        let tuning = tuning();
        let mut rng = StdRng::seed_from_u64(1);
        let mut engine = PlacementEngine::new(&candidates, &tuning, &mut rng);

        let exclude_zones: HashSet<ZoneId> = [ZoneId::new("z1")].into_iter().collect();
        let (worker, _) = engine
            .storage_worker(&exclude_zones, &HashSet::new(), &HashSet::new(), false)
            .unwrap();
        assert_eq!(worker.locality.zone, ZoneId::new("z2"));
    }

    #[test]
    fn test_storage_worker_critical_relaxes_fitness() {
        // Only a proxy-class worker remains: Worst fitness for storage.
        let candidates = vec![candidate("p1", "z1", 1, ClassType::Proxy)];
        let tuning = tuning();
        let mut rng = StdRng::seed_from_u64(1);
        let mut engine = PlacementEngine::new(&candidates, &tuning, &mut rng);

        let err = engine
            .storage_worker(&HashSet::new(), &HashSet::new(), &HashSet::new(), false)
            .unwrap_err();
        assert!(matches!(err, KeystoneError::NoMoreServers(_)));

        let (worker, _) = engine
            .storage_worker(&HashSet::new(), &HashSet::new(), &HashSet::new(), true)
            .unwrap();
        assert_eq!(worker.locality.process, ProcessId::new("p1"));
    }

    #[test]
    fn test_storage_worker_never_uses_testers() {
        let candidates = vec![candidate("p1", "z1", 1, ClassType::Tester)];
        let tuning = tuning();
        let mut rng = StdRng::seed_from_u64(1);
        let mut engine = PlacementEngine::new(&candidates, &tuning, &mut rng);

        // Even critical recruitment cannot use a NeverAssign worker.
        let err = engine
            .storage_worker(&HashSet::new(), &HashSet::new(), &HashSet::new(), true)
            .unwrap_err();
        assert!(matches!(err, KeystoneError::NoMoreServers(_)));
    }

    #[test]
    fn test_master_worker_picks_lowest_fitness() {
        let candidates = vec![
            candidate("p1", "z1", 1, ClassType::Storage),
            candidate("p2", "z2", 2, ClassType::Master),
            candidate("p3", "z3", 3, ClassType::Unset),
        ];
        let tuning = tuning();
        let mut rng = StdRng::seed_from_u64(1);
        let mut engine = PlacementEngine::new(&candidates, &tuning, &mut rng);

        let (worker, class) = engine.master_worker(false).unwrap();
        assert_eq!(worker.locality.process, ProcessId::new("p2"));
        assert_eq!(class.fitness(ClusterRole::Master), Fitness::Best);
    }

    #[test]
    fn test_master_worker_check_stable_skips_rebooting() {
        let mut unstable = candidate("p1", "z1", 1, ClassType::Master);
        unstable.reboots = 2;
        let candidates = vec![unstable, candidate("p2", "z2", 2, ClassType::Unset)];
        let tuning = tuning();
        let mut rng = StdRng::seed_from_u64(1);
        let mut engine = PlacementEngine::new(&candidates, &tuning, &mut rng);

        let (worker, _) = engine.master_worker(true).unwrap();
        assert_eq!(worker.locality.process, ProcessId::new("p2"));

        // Without the stability check the rebooting master-class worker wins.
        let (worker, _) = engine.master_worker(false).unwrap();
        assert_eq!(worker.locality.process, ProcessId::new("p1"));
    }

    #[test]
    fn test_transaction_logs_prefers_best_fitness_team() {
        let candidates = vec![
            candidate("p1", "z1", 1, ClassType::TransactionLog),
            candidate("p2", "z2", 2, ClassType::TransactionLog),
            candidate("p3", "z3", 3, ClassType::TransactionLog),
            candidate("p4", "z4", 4, ClassType::Unset),
        ];
        let tuning = tuning();
        let mut rng = StdRng::seed_from_u64(1);
        let mut engine = PlacementEngine::new(&candidates, &tuning, &mut rng);

        let mut id_used = HashMap::new();
        let team = engine
            .transaction_logs(&conf(3, 3), &mut id_used, false)
            .unwrap();
        assert_eq!(team.len(), 3);
        for (worker, class) in &team {
            assert_eq!(class.class_type, ClassType::TransactionLog);
            assert_eq!(id_used[worker.process_id()], 1);
        }
    }

    #[test]
    fn test_transaction_logs_requires_policy() {
        // Three workers but only two zones: across(3, zone) cannot hold.
        let candidates = vec![
            candidate("p1", "z1", 1, ClassType::TransactionLog),
            candidate("p2", "z1", 2, ClassType::TransactionLog),
            candidate("p3", "z2", 3, ClassType::TransactionLog),
        ];
        let tuning = tuning();
        let mut rng = StdRng::seed_from_u64(1);
        let mut engine = PlacementEngine::new(&candidates, &tuning, &mut rng);

        let mut id_used = HashMap::new();
        let err = engine
            .transaction_logs(&conf(3, 3), &mut id_used, false)
            .unwrap_err();
        assert!(matches!(err, KeystoneError::NoMoreServers(_)));
        assert!(id_used.is_empty());
    }

    #[test]
    fn test_transaction_logs_cuts_oversized_pool_to_desired() {
        let candidates: Vec<Candidate> = (0..6)
            .map(|i| {
                candidate(
                    &format!("p{}", i),
                    &format!("z{}", i),
                    4000 + i as u16,
                    ClassType::TransactionLog,
                )
            })
            .collect();
        let tuning = tuning();
        let mut rng = StdRng::seed_from_u64(1);
        let mut engine = PlacementEngine::new(&candidates, &tuning, &mut rng);

        let mut id_used = HashMap::new();
        let team = engine
            .transaction_logs(&conf(3, 4), &mut id_used, false)
            .unwrap();
        assert_eq!(team.len(), 4);
    }

    #[test]
    fn test_worker_for_role_falls_back_to_other_dc() {
        // The only proxy-fit worker lives in dc2.
        let mut remote = candidate("p2", "z2", 2, ClassType::Proxy);
        remote.worker.locality.dc = Some(DcId::new("dc2"));
        let candidates = vec![remote];

        let tuning = tuning();
        let mut rng = StdRng::seed_from_u64(1);
        let mut engine = PlacementEngine::new(&candidates, &tuning, &mut rng);

        let dc1 = DcId::new("dc1");
        let mut id_used = HashMap::new();
        let fit = engine
            .worker_for_role_in_dc(
                Some(&dc1),
                ClusterRole::Proxy,
                &conf(1, 1),
                &mut id_used,
                false,
            )
            .unwrap();
        assert_eq!(fit.worker.locality.process, ProcessId::new("p2"));
    }

    #[test]
    fn test_workers_for_role_respects_min_worker() {
        let candidates = vec![
            candidate("p1", "z1", 1, ClassType::Proxy),
            candidate("p2", "z2", 2, ClassType::Unset),
            candidate("p3", "z3", 3, ClassType::Storage),
        ];
        let tuning = tuning();
        let mut rng = StdRng::seed_from_u64(1);
        let mut engine = PlacementEngine::new(&candidates, &tuning, &mut rng);

        let mut id_used = HashMap::new();
        let first = engine
            .worker_for_role_in_dc(None, ClusterRole::Proxy, &conf(1, 1), &mut id_used, false)
            .unwrap();
        assert_eq!(first.fitness, Fitness::Best);

        // Remaining candidates are UnsetFit and Worst: both worse than the
        // Best-fit minimum, so nothing qualifies.
        let more = engine.workers_for_role_in_dc(
            None,
            ClusterRole::Proxy,
            2,
            &conf(1, 1),
            &mut id_used,
            &first,
            false,
        );
        assert!(more.is_empty());
    }

    #[test]
    fn test_find_workers_happy_path() {
        let candidates = vec![
            candidate("p1", "z1", 1, ClassType::Master),
            candidate("p2", "z2", 2, ClassType::TransactionLog),
            candidate("p3", "z3", 3, ClassType::TransactionLog),
            candidate("p4", "z4", 4, ClassType::TransactionLog),
            candidate("p5", "z5", 5, ClassType::Proxy),
            candidate("p6", "z6", 6, ClassType::Resolver),
        ];
        let tuning = tuning();
        let mut rng = StdRng::seed_from_u64(1);
        let mut engine = PlacementEngine::new(&candidates, &tuning, &mut rng);

        let master_process = ProcessId::new("p1");
        let reply = engine
            .find_workers_for_configuration(
                &conf(3, 3),
                Some(&master_process),
                Duration::from_secs(60),
            )
            .unwrap();

        let log_processes: HashSet<&ProcessId> =
            reply.logs.iter().map(|w| w.process_id()).collect();
        assert_eq!(
            log_processes,
            [&ProcessId::new("p2"), &ProcessId::new("p3"), &ProcessId::new("p4")]
                .into_iter()
                .collect()
        );
        assert_eq!(reply.proxies.len(), 1);
        assert_eq!(reply.proxies[0].process_id(), &ProcessId::new("p5"));
        assert_eq!(reply.resolvers.len(), 1);
        assert_eq!(reply.resolvers[0].process_id(), &ProcessId::new("p6"));
    }

    #[test]
    fn test_find_workers_grace_window_holds_out() {
        // All log candidates are storage-class (Okay): worse than the Best
        // target, so recruitment inside the window is refused.
        let candidates = vec![
            candidate("p1", "z1", 1, ClassType::Storage),
            candidate("p2", "z2", 2, ClassType::Storage),
            candidate("p3", "z3", 3, ClassType::Storage),
            candidate("p4", "z4", 4, ClassType::Proxy),
            candidate("p5", "z5", 5, ClassType::Resolver),
        ];
        let mut tuning = tuning();
        tuning.expected_log_fitness = Fitness::Best;
        let mut rng = StdRng::seed_from_u64(1);
        let mut engine = PlacementEngine::new(&candidates, &tuning, &mut rng);

        let err = engine
            .find_workers_for_configuration(&conf(3, 3), None, Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, KeystoneError::OperationFailed));

        // The same inputs succeed once the grace window has elapsed.
        let reply = engine
            .find_workers_for_configuration(&conf(3, 3), None, Duration::from_secs(60))
            .unwrap();
        assert_eq!(reply.logs.len(), 3);
    }

    #[test]
    fn test_find_workers_deterministic_under_seed() {
        let candidates: Vec<Candidate> = (0..9)
            .map(|i| {
                candidate(
                    &format!("p{}", i),
                    &format!("z{}", i % 5),
                    4100 + i as u16,
                    if i % 3 == 0 {
                        ClassType::TransactionLog
                    } else if i % 3 == 1 {
                        ClassType::Proxy
                    } else {
                        ClassType::Resolver
                    },
                )
            })
            .collect();
        let tuning = tuning();
        let config = conf(2, 3);

        let run = |seed: u64| {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut engine = PlacementEngine::new(&candidates, &tuning, &mut rng);
            let reply = engine
                .find_workers_for_configuration(&config, None, Duration::from_secs(60))
                .unwrap();
            (
                reply
                    .logs
                    .iter()
                    .map(|w| w.process_id().clone())
                    .collect::<Vec<_>>(),
                reply
                    .proxies
                    .iter()
                    .map(|w| w.process_id().clone())
                    .collect::<Vec<_>>(),
                reply
                    .resolvers
                    .iter()
                    .map(|w| w.process_id().clone())
                    .collect::<Vec<_>>(),
            )
        };

        assert_eq!(run(42), run(42));
    }

    #[test]
    fn test_txn_fitness_ordering() {
        // Worse max fitness loses regardless of counts.
        let good = TxnSystemFitness::from_parts(Fitness::Best, Fitness::Best, 1, 1);
        let bad = TxnSystemFitness::from_parts(Fitness::Worst, Fitness::Best, 5, 5);
        assert!(good < bad);

        // Equal fitness: more proxies is better.
        let many = TxnSystemFitness::from_parts(Fitness::Best, Fitness::Best, 3, 1);
        let few = TxnSystemFitness::from_parts(Fitness::Best, Fitness::Best, 1, 1);
        assert!(many < few);
    }

    #[test]
    fn test_log_team_fitness_ordering() {
        let better = LogTeamFitness {
            fitness: Fitness::Best,
            count: 3,
        };
        let worse_fit = LogTeamFitness {
            fitness: Fitness::Okay,
            count: 3,
        };
        let fewer = LogTeamFitness {
            fitness: Fitness::Best,
            count: 2,
        };
        assert!(better < worse_fit);
        assert!(better < fewer);
    }
}
