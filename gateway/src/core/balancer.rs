//! Account selection strategies and the usage/latency counters behind them

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;

use shared::AccountId;

use crate::types::OperationType;

/// How the router picks among eligible accounts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    RoundRobin,
    Random,
    #[default]
    LeastUsed,
    FastestResponse,
}

impl fmt::Display for RoutingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoutingStrategy::RoundRobin => "round_robin",
            RoutingStrategy::Random => "random",
            RoutingStrategy::LeastUsed => "least_used",
            RoutingStrategy::FastestResponse => "fastest_response",
        };
        write!(f, "{name}")
    }
}

/// Selection state shared by all routes
#[derive(Debug)]
pub struct Balancer {
    round_robin: HashMap<String, usize>,
    usage: HashMap<AccountId, u64>,
    latencies: HashMap<AccountId, VecDeque<f64>>,
    latency_window: usize,
}

impl Balancer {
    pub fn new(latency_window: usize) -> Self {
        Self {
            round_robin: HashMap::new(),
            usage: HashMap::new(),
            latencies: HashMap::new(),
            latency_window: latency_window.max(1),
        }
    }

    /// Index into `candidates` chosen by `strategy`, or None when empty.
    /// Ties resolve to the earliest candidate.
    pub fn select(&mut self, candidates: &[AccountId], operation: OperationType, strategy: RoutingStrategy) -> Option<usize> {
        match candidates.len() {
            0 => return None,
            1 => return Some(0),
            _ => {}
        }

        let index = match strategy {
            RoutingStrategy::RoundRobin => {
                let counter = self.round_robin.entry(format!("{operation}_{strategy}")).or_insert(0);
                let index = *counter % candidates.len();
                *counter += 1;
                index
            }
            RoutingStrategy::Random => rand::thread_rng().gen_range(0..candidates.len()),
            RoutingStrategy::LeastUsed => min_index(candidates, |id| self.usage_count(id) as f64),
            RoutingStrategy::FastestResponse => {
                min_index(candidates, |id| self.average_latency(id).unwrap_or(f64::INFINITY))
            }
        };
        Some(index)
    }

    pub fn record_usage(&mut self, account_id: AccountId) {
        *self.usage.entry(account_id).or_insert(0) += 1;
    }

    /// Keep only the newest `latency_window` samples
    pub fn record_latency(&mut self, account_id: AccountId, latency_ms: f64) {
        let samples = self.latencies.entry(account_id).or_default();
        samples.push_back(latency_ms);
        while samples.len() > self.latency_window {
            samples.pop_front();
        }
    }

    pub fn usage_count(&self, account_id: &AccountId) -> u64 {
        self.usage.get(account_id).copied().unwrap_or(0)
    }

    pub fn average_latency(&self, account_id: &AccountId) -> Option<f64> {
        let samples = self.latencies.get(account_id)?;
        if samples.is_empty() {
            return None;
        }
        Some(samples.iter().sum::<f64>() / samples.len() as f64)
    }

    pub fn latency_samples(&self, account_id: &AccountId) -> usize {
        self.latencies.get(account_id).map_or(0, VecDeque::len)
    }

    pub fn usage_distribution(&self) -> HashMap<AccountId, u64> {
        self.usage.clone()
    }

    pub fn average_latencies(&self) -> HashMap<AccountId, f64> {
        self.latencies
            .keys()
            .filter_map(|id| self.average_latency(id).map(|avg| (*id, avg)))
            .collect()
    }
}

fn min_index(candidates: &[AccountId], key: impl Fn(&AccountId) -> f64) -> usize {
    let mut best = 0;
    let mut best_key = key(&candidates[0]);
    for (i, id) in candidates.iter().enumerate().skip(1) {
        let k = key(id);
        if k < best_key {
            best = i;
            best_key = k;
        }
    }
    best
}
