//! Synthetic drift episode generator
//!
//! Produces the frozen episode sets the benchmark runs against: streams
//! of API-surface snapshots where endpoints occasionally drift (version
//! bumps, parameter changes). Drifted steps are the critical,
//! high-utility ones; redundant repeats are low-utility. The hidden
//! per-step utility goes into the labels; policies only ever see the
//! bounded `priority` surrogate.

use std::collections::{BTreeMap, BTreeSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Map, Value};

use crate::episode::{Episode, EpisodeLabels, Step};

/// Drift regime for a generated episode set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Default,
    BurstDrift,
    Redundancy,
    BurstRedundancy,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Default => "default",
            Mode::BurstDrift => "burst_drift",
            Mode::Redundancy => "redundancy",
            Mode::BurstRedundancy => "burst_redundancy",
        }
    }

    pub fn all() -> &'static [Mode] {
        &[
            Mode::Default,
            Mode::BurstDrift,
            Mode::Redundancy,
            Mode::BurstRedundancy,
        ]
    }

    fn bursty(&self) -> bool {
        matches!(self, Mode::BurstDrift | Mode::BurstRedundancy)
    }

    fn redundant(&self) -> bool {
        matches!(self, Mode::Redundancy | Mode::BurstRedundancy)
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "default" => Ok(Mode::Default),
            "burst_drift" => Ok(Mode::BurstDrift),
            "redundancy" => Ok(Mode::Redundancy),
            "burst_redundancy" => Ok(Mode::BurstRedundancy),
            _ => Err(format!("Unknown mode: {}", s)),
        }
    }
}

/// Generator configuration
#[derive(Debug, Clone)]
pub struct DriftConfig {
    pub steps: u64,
    pub api_pool: usize,
    pub drift_prob: f64,
    pub max_params: usize,
    pub seed: u64,
    pub mode: Mode,
    /// Burst regimes: window spacing, length, and in-window drift
    /// probability
    pub burst_interval: u64,
    pub burst_len: u64,
    pub burst_drift_prob: f64,
    /// Redundancy regimes: probability of repeating the previous endpoint
    pub redundancy_prob: f64,
}

impl Default for DriftConfig {
    fn default() -> Self {
        DriftConfig {
            steps: 200,
            api_pool: 8,
            drift_prob: 0.08,
            max_params: 6,
            seed: 0,
            mode: Mode::Default,
            burst_interval: 50,
            burst_len: 8,
            burst_drift_prob: 0.6,
            redundancy_prob: 0.7,
        }
    }
}

impl DriftConfig {
    fn in_burst_window(&self, t: u64) -> bool {
        self.burst_interval > 0 && (t % self.burst_interval) < self.burst_len
    }
}

fn build_observation(api_id: usize, version: u64, params: &[String], deprecated: bool) -> Value {
    json!({
        "api": format!("api.v{version}.endpoint_{api_id}"),
        "params": params,
        "deprecated": deprecated,
        "version": version,
    })
}

/// Generate one episode; deterministic in (config.seed, episode_id)
pub fn generate_episode(episode_id: u64, config: &DriftConfig) -> Episode {
    let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(episode_id));

    let mut versions: Vec<u64> = vec![1; config.api_pool];
    let mut params: Vec<Vec<String>> = (0..config.api_pool)
        .map(|idx| {
            let count = rng.gen_range(2..=config.max_params);
            (0..count).map(|j| format!("p{idx}_{j}")).collect()
        })
        .collect();

    let mut steps = Vec::with_capacity(config.steps as usize);
    let mut critical_steps = BTreeSet::new();
    let mut utilities = BTreeMap::new();
    let mut last_api_id: Option<usize> = None;

    for t in 0..config.steps {
        let bursty = config.mode.bursty();
        let redundant = config.mode.redundant();

        // Redundancy regimes often repeat the previous endpoint in a
        // streak.
        let api_id = match last_api_id {
            Some(last) if redundant && rng.gen::<f64>() < config.redundancy_prob => last,
            _ => rng.gen_range(0..config.api_pool),
        };

        let drift_p = if bursty && config.in_burst_window(t) {
            config.burst_drift_prob
        } else {
            config.drift_prob
        };
        let drift = rng.gen::<f64>() < drift_p;
        if drift {
            versions[api_id] += 1;
            if rng.gen::<f64>() < 0.5 && !params[api_id].is_empty() {
                params[api_id].pop();
            } else {
                params[api_id].push(format!("p{}_{}", api_id, versions[api_id]));
            }
        }

        let deprecated = drift && rng.gen::<f64>() < 0.3;
        let observation =
            build_observation(api_id, versions[api_id], &params[api_id], deprecated);

        // True drift is what a policy should retain; redundant repeats
        // are filler.
        let utility: f64 = if drift {
            if bursty && config.in_burst_window(t) {
                6.0
            } else {
                5.0
            }
        } else if redundant && last_api_id == Some(api_id) {
            0.5
        } else {
            1.0
        };

        // Utility is a supervision label and stays hidden; the
        // privileged track sees only this bounded surrogate.
        let priority = (utility / 6.0).clamp(0.0, 1.0);
        let mut metadata = Map::new();
        metadata.insert("mode".into(), json!(config.mode.as_str()));
        metadata.insert("priority".into(), json!(priority));

        if drift {
            critical_steps.insert(t);
        }
        utilities.insert(t, utility);
        steps.push(Step::with_metadata(t, observation, metadata));
        last_api_id = Some(api_id);
    }

    let max_utility: f64 = utilities.values().sum();
    let total_drift_events = critical_steps.len() as u64;
    let mut labels = EpisodeLabels::new(critical_steps, total_drift_events);
    labels.per_step_utility = utilities;
    labels.extra.insert("episode_id".into(), json!(episode_id));
    labels
        .extra
        .insert("mode".into(), json!(config.mode.as_str()));
    labels.extra.insert("max_utility".into(), json!(max_utility));

    Episode::new(steps, labels)
}

/// Generate `count` episodes with ids `0..count`
pub fn generate_episodes(count: u64, config: &DriftConfig) -> Vec<Episode> {
    (0..count).map(|id| generate_episode(id, config)).collect()
}
