//! Evaluator driver
//!
//! Iterates episode sets x budgets x policies x tracks, owning one fresh
//! memory store and policy instance per condition. Actions are applied
//! strictly in emission order; rejections are counted, never retried.
//! After every step the store's invariants are re-checked -- a failure
//! there is an implementation bug and aborts the run.

use std::fmt::Write as _;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::Serialize;
use tracing::debug;

use crate::baselines::{build_policy, default_policies};
use crate::episode::Episode;
use crate::error::{BenchError, Result};
use crate::memory::MemoryStore;
use crate::metrics::{score, ActionCounts, MetricRecord};
use crate::policy::{condition_seed, policy_view, Track, WritePolicy};

/// Default budget grid in bytes
pub const DEFAULT_BUDGETS: [u64; 4] = [1024, 10_240, 102_400, 1_048_576];

/// Fixed results-table column order
pub const RESULT_COLUMNS: [&str; 21] = [
    "set",
    "episode_id",
    "budget_bytes",
    "policy",
    "track",
    "recall",
    "precision",
    "f1",
    "utility_per_kb",
    "regret",
    "avg_staleness",
    "drift_coverage",
    "expire_rate",
    "utilization",
    "write_density",
    "bytes_used",
    "writes",
    "merges",
    "expires",
    "skips",
    "rejections",
];

/// Grid of conditions to evaluate
#[derive(Debug, Clone)]
pub struct GridConfig {
    pub budgets: Vec<u64>,
    /// Policy ids; empty means the per-track default set
    pub policies: Vec<String>,
    pub tracks: Vec<Track>,
}

impl Default for GridConfig {
    fn default() -> Self {
        GridConfig {
            budgets: DEFAULT_BUDGETS.to_vec(),
            policies: Vec::new(),
            tracks: Track::all().to_vec(),
        }
    }
}

impl GridConfig {
    fn policy_ids(&self, track: Track) -> Vec<String> {
        if self.policies.is_empty() {
            default_policies(track)
                .iter()
                .map(|id| (*id).to_string())
                .collect()
        } else {
            self.policies.clone()
        }
    }
}

/// One applied (or rejected) action in the log
#[derive(Debug, Clone, Serialize)]
pub struct LoggedAction {
    /// Timestep being processed when the action was emitted
    pub t: u64,
    pub action: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_t: Option<u64>,
    pub accepted: bool,
}

/// Per-condition action log record
#[derive(Debug, Clone, Serialize)]
pub struct ActionLogRecord {
    pub set: String,
    pub episode_id: String,
    pub budget_bytes: u64,
    pub policy: String,
    pub track: String,
    pub actions: Vec<LoggedAction>,
}

/// Everything one condition produced
#[derive(Debug, Clone)]
pub struct ConditionOutcome {
    pub metrics: MetricRecord,
    pub counts: ActionCounts,
    pub actions: Vec<LoggedAction>,
}

/// One results-table row
#[derive(Debug, Clone)]
pub struct ResultRow {
    pub set: String,
    pub episode_id: String,
    pub budget_bytes: u64,
    pub policy: String,
    pub track: Track,
    pub metrics: MetricRecord,
    pub counts: ActionCounts,
}

fn fmt_metric(value: f64) -> String {
    format!("{value:.6}")
}

impl ResultRow {
    /// Render as a CSV line in the fixed column order
    pub fn to_csv(&self) -> String {
        let m = &self.metrics;
        let c = &self.counts;
        let mut line = String::new();
        let _ = write!(
            line,
            "{},{},{},{},{}",
            self.set, self.episode_id, self.budget_bytes, self.policy, self.track
        );
        for value in [
            m.recall,
            m.precision,
            m.f1,
            m.utility_per_kb,
            m.regret,
            m.avg_staleness,
            m.drift_coverage,
            m.expire_rate,
            m.utilization,
            m.write_density,
        ] {
            let _ = write!(line, ",{}", fmt_metric(value));
        }
        let _ = write!(
            line,
            ",{},{},{},{},{},{}",
            m.bytes_used, c.writes, c.merges, c.expires, c.skips, c.rejections
        );
        line
    }
}

/// The CSV header row
pub fn results_header() -> String {
    RESULT_COLUMNS.join(",")
}

/// Render the whole results table (header + rows)
pub fn results_to_csv(rows: &[ResultRow]) -> String {
    let mut out = results_header();
    out.push('\n');
    for row in rows {
        out.push_str(&row.to_csv());
        out.push('\n');
    }
    out
}

/// Run one (episode, budget, policy, track) condition.
///
/// The policy and the store both see the track view of each step, so a
/// policy can never smuggle hidden metadata into byte accounting.
pub fn run_condition(
    policy: &mut dyn WritePolicy,
    episode: &Episode,
    budget_bytes: u64,
    track: Track,
) -> Result<ConditionOutcome> {
    let mut store = MemoryStore::new(budget_bytes);
    let view_steps: Vec<_> = episode
        .steps
        .iter()
        .map(|step| policy_view(step, track))
        .collect();

    let mut counts = ActionCounts::default();
    let mut log = Vec::new();
    for step in &view_steps {
        let actions = policy.select(step, &store.view());
        for action in &actions {
            let accepted = store.apply(action, step.t);
            if accepted {
                match action.kind() {
                    "WRITE" => counts.writes += 1,
                    "MERGE" => counts.merges += 1,
                    "EXPIRE" => counts.expires += 1,
                    _ => counts.skips += 1,
                }
            } else {
                counts.rejections += 1;
            }
            log.push(LoggedAction {
                t: step.t,
                action: action.kind(),
                target_t: action.target_t(),
                accepted,
            });
        }
        store
            .verify_invariants()
            .map_err(BenchError::InvariantViolation)?;
    }

    let metrics = score(&store, &episode.labels, &view_steps, &counts);
    Ok(ConditionOutcome {
        metrics,
        counts,
        actions: log,
    })
}

/// Run the full grid over named episode sets.
///
/// Returns the results rows plus the per-condition action log, in a
/// deterministic order: set, budget, episode, track, policy.
pub fn run_grid(
    sets: &[(String, Vec<Episode>)],
    config: &GridConfig,
) -> Result<(Vec<ResultRow>, Vec<ActionLogRecord>)> {
    let mut rows = Vec::new();
    let mut logs = Vec::new();

    for (set_name, episodes) in sets {
        for &budget_bytes in &config.budgets {
            for (index, episode) in episodes.iter().enumerate() {
                let episode_id = episode
                    .labels
                    .episode_id()
                    .unwrap_or_else(|| index.to_string());
                for &track in &config.tracks {
                    for policy_id in config.policy_ids(track) {
                        let seed = condition_seed(&episode_id, budget_bytes, &policy_id, track);
                        let mut policy = build_policy(&policy_id, seed)?;
                        debug!(
                            set = %set_name,
                            episode = %episode_id,
                            budget_bytes,
                            policy = %policy_id,
                            track = %track,
                            "running condition"
                        );
                        let outcome =
                            run_condition(policy.as_mut(), episode, budget_bytes, track)?;
                        logs.push(ActionLogRecord {
                            set: set_name.clone(),
                            episode_id: episode_id.clone(),
                            budget_bytes,
                            policy: policy_id.clone(),
                            track: track.to_string(),
                            actions: outcome.actions,
                        });
                        rows.push(ResultRow {
                            set: set_name.clone(),
                            episode_id: episode_id.clone(),
                            budget_bytes,
                            policy: policy_id,
                            track,
                            metrics: outcome.metrics,
                            counts: outcome.counts,
                        });
                    }
                }
            }
        }
    }
    Ok((rows, logs))
}

/// Write the results table to disk
pub fn write_results_csv(path: impl AsRef<Path>, rows: &[ResultRow]) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, results_to_csv(rows))?;
    Ok(())
}

/// Write the per-condition action log as JSONL
pub fn write_action_log(path: impl AsRef<Path>, records: &[ActionLogRecord]) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut writer = BufWriter::new(fs::File::create(path)?);
    for record in records {
        serde_json::to_writer(&mut writer, record)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}
