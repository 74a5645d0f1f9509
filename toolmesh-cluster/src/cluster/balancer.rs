//! Load balancing for cluster requests
//!
//! Picks one node out of the healthy set. Callers filter by health first;
//! the balancer only sees candidates.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::node::ClusterNode;
use crate::error::Error;

/// Load balancing strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    /// Cycle through nodes in table order
    #[default]
    RoundRobin,
    /// Node with the fewest in-flight calls; ties go to the first
    LeastConnections,
    /// Uniform random selection
    Random,
    /// Random selection proportional to instance weight
    WeightedRandom,
}

impl fmt::Display for LoadBalancingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::RoundRobin => "round_robin",
            Self::LeastConnections => "least_connections",
            Self::Random => "random",
            Self::WeightedRandom => "weighted_random",
        };
        f.write_str(s)
    }
}

impl FromStr for LoadBalancingStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "round_robin" | "roundrobin" => Ok(Self::RoundRobin),
            "least_connections" | "leastconnections" => Ok(Self::LeastConnections),
            "random" => Ok(Self::Random),
            "weighted_random" | "weightedrandom" => Ok(Self::WeightedRandom),
            other => Err(Error::InvalidArgument(format!(
                "unknown load balancing strategy '{other}'"
            ))),
        }
    }
}

/// Strategy plus the round-robin cursor it needs.
#[derive(Debug)]
pub(crate) struct LoadBalancer {
    strategy: LoadBalancingStrategy,
    round_robin_index: AtomicUsize,
}

impl LoadBalancer {
    pub(crate) const fn new(strategy: LoadBalancingStrategy) -> Self {
        Self {
            strategy,
            round_robin_index: AtomicUsize::new(0),
        }
    }

    pub(crate) const fn strategy(&self) -> LoadBalancingStrategy {
        self.strategy
    }

    /// Select one of `candidates`, or `None` when there are none.
    pub(crate) fn select(&self, candidates: &[Arc<ClusterNode>]) -> Option<Arc<ClusterNode>> {
        if candidates.is_empty() {
            return None;
        }
        let selected = match self.strategy {
            LoadBalancingStrategy::RoundRobin => {
                let index =
                    self.round_robin_index.fetch_add(1, Ordering::AcqRel) % candidates.len();
                &candidates[index]
            }
            LoadBalancingStrategy::LeastConnections => candidates
                .iter()
                .min_by_key(|n| n.connections())?,
            LoadBalancingStrategy::Random => candidates.choose(&mut rand::thread_rng())?,
            LoadBalancingStrategy::WeightedRandom => weighted_pick(candidates)?,
        };
        Some(selected.clone())
    }
}

fn weighted_pick(candidates: &[Arc<ClusterNode>]) -> Option<&Arc<ClusterNode>> {
    let weights: Vec<u64> = candidates.iter().map(|n| n.weight()).collect();
    let total: u64 = weights.iter().sum();
    if total == 0 {
        return candidates.first();
    }
    let mut draw = rand::thread_rng().gen_range(0..total);
    for (node, weight) in candidates.iter().zip(weights) {
        if draw < weight {
            return Some(node);
        }
        draw -= weight;
    }
    candidates.last()
}
