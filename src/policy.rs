//! Replication policies over locality sets.
//!
//! A [`ReplicationPolicy`] is a predicate asserting that a candidate set of
//! workers is spread across enough fault domains to survive correlated
//! failures. The controller validates log teams against the configured
//! policy during recruitment and uses a randomized search to cut oversized
//! candidate sets down to a satisfying team of the desired size.

use crate::types::Locality;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::fmt;

/// The locality dimension a policy spreads across.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalityDimension {
    Zone,
    DataHall,
    Dc,
}

impl LocalityDimension {
    fn value_of(&self, locality: &Locality) -> Option<String> {
        match self {
            LocalityDimension::Zone => Some(locality.zone.as_str().to_string()),
            LocalityDimension::DataHall => {
                locality.data_hall.as_ref().map(|h| h.as_str().to_string())
            }
            LocalityDimension::Dc => locality.dc.as_ref().map(|d| d.as_str().to_string()),
        }
    }
}

impl fmt::Display for LocalityDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LocalityDimension::Zone => "zone",
            LocalityDimension::DataHall => "data_hall",
            LocalityDimension::Dc => "dc",
        };
        write!(f, "{}", s)
    }
}

/// Predicate over a set of localities asserting fault-tolerant spread.
pub trait ReplicationPolicy: Send + Sync + fmt::Debug {
    /// Short description for tracing, e.g. `across(3, zone)`.
    fn name(&self) -> String;

    /// True when the candidate set satisfies the policy.
    fn validate(&self, localities: &[Locality]) -> bool;
}

/// Trivial policy: any non-empty set is acceptable.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyOne;

impl ReplicationPolicy for PolicyOne {
    fn name(&self) -> String {
        "one".to_string()
    }

    fn validate(&self, localities: &[Locality]) -> bool {
        !localities.is_empty()
    }
}

/// Requires at least `count` distinct values of one locality dimension.
/// A worker with no value for the dimension never contributes to it.
#[derive(Debug, Clone, Copy)]
pub struct PolicyAcross {
    pub count: usize,
    pub dimension: LocalityDimension,
}

impl PolicyAcross {
    pub fn new(count: usize, dimension: LocalityDimension) -> Self {
        Self { count, dimension }
    }
}

impl ReplicationPolicy for PolicyAcross {
    fn name(&self) -> String {
        format!("across({}, {})", self.count, self.dimension)
    }

    fn validate(&self, localities: &[Locality]) -> bool {
        let distinct: HashSet<String> = localities
            .iter()
            .filter_map(|l| self.dimension.value_of(l))
            .collect();
        distinct.len() >= self.count
    }
}

/// Diversity score used to rate satisfying subsets against each other:
/// the number of distinct (zone, data hall, dc) combinations covered.
fn diversity(localities: &[Locality], indices: &[usize]) -> usize {
    let tuples: HashSet<(String, Option<String>, Option<String>)> = indices
        .iter()
        .map(|&i| {
            let l = &localities[i];
            (
                l.zone.as_str().to_string(),
                l.data_hall.as_ref().map(|h| h.as_str().to_string()),
                l.dc.as_ref().map(|d| d.as_str().to_string()),
            )
        })
        .collect();
    tuples.len()
}

/// Search for a subset of exactly `target` candidates that satisfies the
/// policy, preferring subsets spread over more fault domains.
///
/// Runs `generations` rounds of randomized selection, scoring each
/// satisfying subset by locality diversity sampled over `rating_tests`
/// draws, and returns the best subset found (indices into `localities`).
/// Returns `None` when no satisfying subset of the target size was found.
pub fn find_best_policy_set(
    localities: &[Locality],
    policy: &dyn ReplicationPolicy,
    target: usize,
    rating_tests: u32,
    generations: u32,
    rng: &mut StdRng,
) -> Option<Vec<usize>> {
    if localities.len() < target || target == 0 {
        return None;
    }

    let mut best: Option<(usize, Vec<usize>)> = None;
    let mut indices: Vec<usize> = (0..localities.len()).collect();

    // A deterministic first pass: greedily take one candidate per unseen
    // zone, then fill. Catches the common case before the random rounds.
    let mut greedy: Vec<usize> = Vec::with_capacity(target);
    let mut seen_zones: HashSet<&str> = HashSet::new();
    for (i, l) in localities.iter().enumerate() {
        if greedy.len() == target {
            break;
        }
        if seen_zones.insert(l.zone.as_str()) {
            greedy.push(i);
        }
    }
    for i in 0..localities.len() {
        if greedy.len() == target {
            break;
        }
        if !greedy.contains(&i) {
            greedy.push(i);
        }
    }
    if greedy.len() == target {
        let set: Vec<Locality> = greedy.iter().map(|&i| localities[i].clone()).collect();
        if policy.validate(&set) {
            best = Some((diversity(localities, &greedy), greedy));
        }
    }

    let attempts = generations.max(1);
    let rating_budget = rating_tests.max(1);
    for round in 0..attempts {
        // The rating budget bounds total work: stop refining once the
        // sampled rounds exceed it and a satisfying set is in hand.
        if best.is_some() && round >= rating_budget {
            break;
        }
        indices.shuffle(&mut *rng);
        let candidate: Vec<usize> = indices[..target].to_vec();
        let set: Vec<Locality> = candidate.iter().map(|&i| localities[i].clone()).collect();
        if !policy.validate(&set) {
            continue;
        }
        let score = diversity(localities, &candidate);
        let improves = match &best {
            Some((best_score, _)) => score > *best_score,
            None => true,
        };
        if improves {
            best = Some((score, candidate));
        }
    }

    best.map(|(_, set)| set)
}
