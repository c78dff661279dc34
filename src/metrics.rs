//! Metric engine
//!
//! Consumes the final memory contents plus episode labels and produces
//! the benchmark metrics. Scoring is total: every empty-denominator case
//! resolves to a pinned default rather than an error, and the regret
//! reference is an exact WRITE-only knapsack oracle so two runs over a
//! frozen episode set produce identical numbers.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::encoding::estimate_bytes;
use crate::episode::{EpisodeLabels, Step};
use crate::memory::MemoryStore;

/// Counts of successfully applied actions plus rejections over one
/// condition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ActionCounts {
    pub writes: u64,
    pub merges: u64,
    pub expires: u64,
    pub skips: u64,
    pub rejections: u64,
}

/// Metric record for one (episode, budget, policy, track) condition
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricRecord {
    pub recall: f64,
    pub precision: f64,
    pub f1: f64,
    pub utility_per_kb: f64,
    pub regret: f64,
    pub avg_staleness: f64,
    pub drift_coverage: f64,
    pub expire_rate: f64,
    pub utilization: f64,
    pub write_density: f64,
    pub bytes_used: u64,
    /// Total hidden utility of the retained set (not a results-table
    /// column; kept for analysis and oracle checks)
    pub policy_utility: f64,
    /// WRITE-only knapsack optimum for this budget
    pub oracle_utility: f64,
}

/// Retained set W: BASE items always count; a DELTA counts iff its BASE
/// parent survives.
pub fn retained_set(store: &MemoryStore) -> BTreeSet<u64> {
    let mut retained = BTreeSet::new();
    for item in store.items() {
        match item.parent_t() {
            None => {
                retained.insert(item.step.t);
            }
            Some(parent_t) => {
                if store.get(parent_t).is_some_and(|parent| parent.is_base()) {
                    retained.insert(item.step.t);
                }
            }
        }
    }
    retained
}

/// Maximum utility achievable by any subset of steps whose total
/// estimated byte cost fits the budget: exact 0/1 knapsack.
pub fn oracle_utility(costs: &[u64], utils: &[f64], budget_bytes: u64) -> f64 {
    let total_cost: u64 = costs.iter().sum();
    if budget_bytes >= total_cost {
        return utils.iter().sum();
    }
    let budget = budget_bytes as usize;
    let mut dp = vec![0.0f64; budget + 1];
    for (&cost, &util) in costs.iter().zip(utils) {
        let w = cost as usize;
        if w > budget {
            continue;
        }
        for b in (w..=budget).rev() {
            let candidate = dp[b - w] + util;
            if candidate > dp[b] {
                dp[b] = candidate;
            }
        }
    }
    dp[budget]
}

/// Score one finished condition.
///
/// `cost_steps` are the steps as the policy (and the store) saw them --
/// the track view -- so the oracle prices exactly what a WRITE would have
/// been charged.
pub fn score(
    store: &MemoryStore,
    labels: &EpisodeLabels,
    cost_steps: &[Step],
    counts: &ActionCounts,
) -> MetricRecord {
    let retained = retained_set(store);
    let critical = &labels.critical_steps;
    let retained_critical = retained.intersection(critical).count() as f64;

    let recall = if critical.is_empty() {
        if retained.is_empty() {
            1.0
        } else {
            0.0
        }
    } else {
        retained_critical / critical.len() as f64
    };
    let precision = if retained.is_empty() {
        if critical.is_empty() {
            1.0
        } else {
            0.0
        }
    } else {
        retained_critical / retained.len() as f64
    };
    let f1 = if recall == 0.0 || precision == 0.0 {
        0.0
    } else {
        2.0 * recall * precision / (recall + precision)
    };

    let policy_utility: f64 = retained.iter().map(|&t| labels.utility(t)).sum();
    let bytes_used = store.bytes_used();
    let utility_per_kb = if bytes_used == 0 {
        0.0
    } else {
        policy_utility / (bytes_used as f64 / 1024.0)
    };

    let costs: Vec<u64> = cost_steps.iter().map(estimate_bytes).collect();
    let utils: Vec<f64> = cost_steps.iter().map(|s| labels.utility(s.t)).collect();
    let oracle = oracle_utility(&costs, &utils, store.max_bytes());
    // MERGE-enabled policies may legitimately beat the WRITE-only oracle;
    // clamping keeps regret non-negative.
    let regret = (oracle - policy_utility).max(0.0);

    let last_t = cost_steps.last().map(|s| s.t).unwrap_or(0);
    let avg_staleness = if retained.is_empty() {
        0.0
    } else {
        let total: u64 = retained.iter().map(|&t| last_t.saturating_sub(t)).sum();
        total as f64 / retained.len() as f64
    };

    let drift_coverage = if labels.total_drift_events > 0 {
        retained_critical / labels.total_drift_events as f64
    } else {
        0.0
    };
    let expire_rate = counts.expires as f64 / counts.writes.max(1) as f64;
    let utilization = if store.max_bytes() > 0 {
        bytes_used as f64 / store.max_bytes() as f64
    } else {
        0.0
    };
    let write_density = if cost_steps.is_empty() {
        0.0
    } else {
        retained.len() as f64 / cost_steps.len() as f64
    };

    MetricRecord {
        recall,
        precision,
        f1,
        utility_per_kb,
        regret,
        avg_staleness,
        drift_coverage,
        expire_rate,
        utilization,
        write_density,
        bytes_used,
        policy_utility,
        oracle_utility: oracle,
    }
}
