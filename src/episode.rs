//! Episode and step types
//!
//! A step is one observation in a streaming episode; an episode is a
//! finite ordered sequence of steps plus supervision labels. Both are
//! immutable once constructed and compare structurally.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Single timestep in a streaming episode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Timestep index
    pub t: u64,
    /// Arbitrary structured payload
    pub observation: Value,
    /// Auxiliary metadata (priority, source tags, ...)
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Step {
    pub fn new(t: u64, observation: Value) -> Self {
        Step {
            t,
            observation,
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(t: u64, observation: Value, metadata: Map<String, Value>) -> Self {
        Step {
            t,
            observation,
            metadata,
        }
    }

    /// Endpoint identity: the observation's `api` field, when the
    /// observation is an object carrying a non-null value for it
    pub fn api(&self) -> Option<&Value> {
        self.observation
            .as_object()
            .and_then(|obs| obs.get("api"))
            .filter(|api| !api.is_null())
    }
}

/// Supervision labels attached to an episode
///
/// `critical_steps` and `total_drift_events` are required; per-step
/// utilities are optional (missing entries contribute zero utility).
/// Generator provenance such as `episode_id`, `mode`, and `max_utility`
/// travels in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeLabels {
    pub critical_steps: BTreeSet<u64>,
    pub total_drift_events: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub per_step_utility: BTreeMap<u64, f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EpisodeLabels {
    pub fn new(critical_steps: BTreeSet<u64>, total_drift_events: u64) -> Self {
        EpisodeLabels {
            critical_steps,
            total_drift_events,
            per_step_utility: BTreeMap::new(),
            extra: Map::new(),
        }
    }

    /// Hidden per-step utility; zero for unlabeled timesteps
    pub fn utility(&self, t: u64) -> f64 {
        self.per_step_utility.get(&t).copied().unwrap_or(0.0)
    }

    /// Logical episode identity from the generator, if present
    pub fn episode_id(&self) -> Option<String> {
        match self.extra.get("episode_id") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }
}

impl Default for EpisodeLabels {
    fn default() -> Self {
        EpisodeLabels::new(BTreeSet::new(), 0)
    }
}

/// Ordered sequence of steps plus labels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub steps: Vec<Step>,
    pub labels: EpisodeLabels,
}

impl Episode {
    pub fn new(steps: Vec<Step>, labels: EpisodeLabels) -> Self {
        Episode { steps, labels }
    }

    /// Timestep of the final step, if any
    pub fn last_t(&self) -> Option<u64> {
        self.steps.last().map(|s| s.t)
    }

    /// Structural validation: timesteps strictly increasing (contiguity is
    /// not required) and label counts consistent.
    pub fn validate(&self) -> Result<(), String> {
        for pair in self.steps.windows(2) {
            if pair[1].t <= pair[0].t {
                return Err(format!(
                    "timesteps must be strictly increasing, got {} after {}",
                    pair[1].t, pair[0].t
                ));
            }
        }
        let critical = self.labels.critical_steps.len() as u64;
        if self.labels.total_drift_events < critical {
            return Err(format!(
                "total_drift_events ({}) is below |critical_steps| ({})",
                self.labels.total_drift_events, critical
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn labels(critical: &[u64], drift: u64) -> EpisodeLabels {
        EpisodeLabels::new(critical.iter().copied().collect(), drift)
    }

    #[test]
    fn validate_accepts_non_contiguous_increasing_timesteps() {
        let ep = Episode::new(
            vec![
                Step::new(0, json!({"api": "x"})),
                Step::new(3, json!({"api": "x"})),
                Step::new(7, json!({"api": "x"})),
            ],
            labels(&[3], 2),
        );
        assert!(ep.validate().is_ok());
    }

    #[test]
    fn validate_rejects_non_increasing_timesteps() {
        let ep = Episode::new(
            vec![Step::new(2, json!(1)), Step::new(2, json!(2))],
            labels(&[], 0),
        );
        assert!(ep.validate().is_err());
    }

    #[test]
    fn validate_rejects_drift_count_below_critical_count() {
        let ep = Episode::new(vec![Step::new(0, json!(1))], labels(&[0], 0));
        assert!(ep.validate().is_err());
    }

    #[test]
    fn labels_roundtrip_through_json() {
        let mut lbl = labels(&[1, 4], 3);
        lbl.per_step_utility.insert(1, 5.0);
        lbl.per_step_utility.insert(4, 0.5);
        lbl.extra.insert("episode_id".into(), json!(7));
        lbl.extra.insert("mode".into(), json!("default"));

        let text = serde_json::to_string(&lbl).unwrap();
        let back: EpisodeLabels = serde_json::from_str(&text).unwrap();
        assert_eq!(lbl, back);
        assert_eq!(back.episode_id().as_deref(), Some("7"));
        assert_eq!(back.utility(4), 0.5);
        assert_eq!(back.utility(2), 0.0);
    }

    #[test]
    fn api_ignores_null_and_non_object_observations() {
        assert!(Step::new(0, json!({"api": null})).api().is_none());
        assert!(Step::new(0, json!([1, 2])).api().is_none());
        assert_eq!(
            Step::new(0, json!({"api": "x"})).api(),
            Some(&json!("x"))
        );
    }
}
