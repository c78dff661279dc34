//! Scenario tests that lock benchmark behavior
//!
//! Each test drives the evaluator (or the store directly) through a
//! small, fully specified episode and asserts the exact accounting and
//! metric outcomes. Any change in action semantics or scoring will show
//! up here.
//!
//! Run with: cargo test --test golden_tests

use serde_json::{json, Map, Value};

use writepolicybench::encoding::{delta_bytes, estimate_bytes};
use writepolicybench::episode::{Episode, EpisodeLabels, Step};
use writepolicybench::episode_io::episodes_to_jsonl;
use writepolicybench::evaluator::run_condition;
use writepolicybench::memory::{MemoryAction, MemoryStore, StoreView};
use writepolicybench::metrics::retained_set;
use writepolicybench::policy::{Track, WritePolicy};
use writepolicybench::synthetic::{generate_episode, DriftConfig};

/// Replays a fixed action script keyed by timestep
struct Scripted {
    actions: Vec<(u64, Vec<MemoryAction>)>,
}

impl WritePolicy for Scripted {
    fn select(&mut self, step: &Step, _store: &StoreView<'_>) -> Vec<MemoryAction> {
        self.actions
            .iter()
            .find(|(t, _)| *t == step.t)
            .map(|(_, actions)| actions.clone())
            .unwrap_or_else(|| vec![MemoryAction::Skip])
    }
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected object, got {other}"),
    }
}

fn labels(critical: &[u64], drift: u64) -> EpisodeLabels {
    EpisodeLabels::new(critical.iter().copied().collect(), drift)
}

mod scenarios {
    use super::*;

    /// S1: budget zero rejects the write, nothing is retained
    #[test]
    fn zero_budget_rejects_all_writes() {
        let step0 = Step::new(0, json!({"api": "x", "v": 1}));
        let episode = Episode::new(vec![step0.clone()], labels(&[0], 1));
        let mut policy = Scripted {
            actions: vec![(0, vec![MemoryAction::Write { step: step0 }])],
        };

        let outcome = run_condition(&mut policy, &episode, 0, Track::Unprivileged).unwrap();
        assert_eq!(outcome.counts.rejections, 1);
        assert_eq!(outcome.counts.writes, 0);
        assert_eq!(outcome.metrics.bytes_used, 0);
        assert_eq!(outcome.metrics.recall, 0.0);
        assert_eq!(outcome.metrics.write_density, 0.0);
    }

    /// S2: WRITE then EXPIRE round-trip leaves only the newer step
    #[test]
    fn write_then_expire_round_trip() {
        let step0 = Step::new(0, json!({"api": "x", "v": 1}));
        let step1 = Step::new(1, json!({"api": "x", "v": 2}));
        let episode = Episode::new(vec![step0.clone(), step1.clone()], labels(&[1], 1));
        let mut policy = Scripted {
            actions: vec![
                (0, vec![MemoryAction::Write { step: step0 }]),
                (1, vec![
                    MemoryAction::Expire { target_t: 0 },
                    MemoryAction::Write { step: step1.clone() },
                ]),
            ],
        };

        let outcome = run_condition(&mut policy, &episode, 10_240, Track::Unprivileged).unwrap();
        assert_eq!(outcome.counts.writes, 2);
        assert_eq!(outcome.counts.expires, 1);
        assert_eq!(outcome.counts.rejections, 0);
        assert_eq!(outcome.metrics.bytes_used, estimate_bytes(&step1));
        assert_eq!(outcome.metrics.expire_rate, 0.5);
        // W = {1}: half the episode retained, and it is the critical step.
        assert_eq!(outcome.metrics.write_density, 0.5);
        assert_eq!(outcome.metrics.recall, 1.0);
    }

    /// S3: canonical MERGE is accepted and charged delta bytes
    #[test]
    fn canonical_merge_accepted() {
        let step0 = Step::new(0, json!({"api": "x", "v": 1, "p": ["a"]}));
        let step1 = Step::new(1, json!({"api": "x", "v": 2, "p": ["a"]}));
        let episode = Episode::new(vec![step0.clone(), step1.clone()], labels(&[1], 1));
        let delta = object(json!({"v": 2}));
        let mut policy = Scripted {
            actions: vec![
                (0, vec![MemoryAction::Write { step: step0.clone() }]),
                (1, vec![MemoryAction::Merge {
                    step: step1,
                    target_t: 0,
                    delta: Some(delta.clone()),
                }]),
            ],
        };

        let outcome = run_condition(&mut policy, &episode, 10_240, Track::Unprivileged).unwrap();
        assert_eq!(outcome.counts.writes, 1);
        assert_eq!(outcome.counts.merges, 1);
        assert_eq!(outcome.counts.rejections, 0);
        assert_eq!(
            outcome.metrics.bytes_used,
            estimate_bytes(&step0) + delta_bytes(&delta)
        );
        // Both timesteps count toward W.
        assert_eq!(outcome.metrics.write_density, 1.0);
        assert_eq!(outcome.metrics.recall, 1.0);
    }

    /// S3 (store level): one BASE plus one DELTA remain
    #[test]
    fn canonical_merge_store_contents() {
        let mut store = MemoryStore::new(10_240);
        let step0 = Step::new(0, json!({"api": "x", "v": 1, "p": ["a"]}));
        let step1 = Step::new(1, json!({"api": "x", "v": 2, "p": ["a"]}));
        assert!(store.apply(&MemoryAction::Write { step: step0 }, 0));
        assert!(store.apply(
            &MemoryAction::Merge {
                step: step1,
                target_t: 0,
                delta: None,
            },
            1,
        ));

        assert_eq!(store.len(), 2);
        assert!(store.get(0).unwrap().is_base());
        assert_eq!(store.get(1).unwrap().parent_t(), Some(0));
        assert_eq!(retained_set(&store), [0, 1].into_iter().collect());
    }

    /// S4: endpoint-mismatched MERGE is rejected
    #[test]
    fn endpoint_mismatch_merge_rejected() {
        let step0 = Step::new(0, json!({"api": "x", "v": 1, "p": ["a"]}));
        let step1 = Step::new(1, json!({"api": "y", "v": 2}));
        let episode = Episode::new(vec![step0.clone(), step1.clone()], labels(&[0], 1));
        let mut policy = Scripted {
            actions: vec![
                (0, vec![MemoryAction::Write { step: step0 }]),
                (1, vec![MemoryAction::Merge {
                    step: step1,
                    target_t: 0,
                    delta: None,
                }]),
            ],
        };

        let outcome = run_condition(&mut policy, &episode, 10_240, Track::Unprivileged).unwrap();
        assert_eq!(outcome.counts.merges, 0);
        assert_eq!(outcome.counts.rejections, 1);
        // Only t=0 retained.
        assert_eq!(outcome.metrics.write_density, 0.5);
        assert_eq!(outcome.metrics.recall, 1.0);
    }

    /// S5: merging onto a DELTA is rejected
    #[test]
    fn merge_onto_delta_rejected() {
        let mut store = MemoryStore::new(10_240);
        assert!(store.apply(
            &MemoryAction::Write {
                step: Step::new(0, json!({"api": "x", "v": 1, "p": ["a"]})),
            },
            0,
        ));
        assert!(store.apply(
            &MemoryAction::Merge {
                step: Step::new(1, json!({"api": "x", "v": 2, "p": ["a"]})),
                target_t: 0,
                delta: None,
            },
            1,
        ));
        let chained = store.apply(
            &MemoryAction::Merge {
                step: Step::new(2, json!({"api": "x", "v": 3, "p": ["a"]})),
                target_t: 1,
                delta: None,
            },
            2,
        );
        assert!(!chained);
        assert_eq!(store.len(), 2);
    }

    /// S6: a WRITE-only policy never beats the knapsack oracle, and
    /// regret stays clamped at zero or above for every policy
    #[test]
    fn oracle_upper_bounds_write_only_utility() {
        let config = DriftConfig {
            steps: 30,
            seed: 1,
            ..Default::default()
        };
        let episode = generate_episode(0, &config);

        for budget in [512, 2_048, 8_192, 1_000_000] {
            for policy_id in ["fifo_store_all", "last_kb", "uniform_sample"] {
                let mut policy = writepolicybench::baselines::build_policy(policy_id, 0).unwrap();
                let outcome =
                    run_condition(policy.as_mut(), &episode, budget, Track::Unprivileged).unwrap();
                assert!(
                    outcome.metrics.policy_utility <= outcome.metrics.oracle_utility + 1e-9,
                    "{policy_id} at {budget} beat the WRITE-only oracle"
                );
                assert!(outcome.metrics.regret >= 0.0);
            }
            // MERGE-enabled policies may exceed the oracle; the clamp
            // still holds.
            let mut policy =
                writepolicybench::baselines::build_policy("merge_aggressive", 0).unwrap();
            let outcome =
                run_condition(policy.as_mut(), &episode, budget, Track::Unprivileged).unwrap();
            assert!(outcome.metrics.regret >= 0.0);
        }
    }
}

mod wire_format {
    use super::*;

    /// Locks the canonical JSONL line for a small episode
    #[test]
    fn episode_serialization_golden() {
        let mut lbl = labels(&[0], 1);
        lbl.per_step_utility.insert(0, 1.5);
        lbl.extra.insert("episode_id".into(), json!(0));
        let episode = Episode::new(vec![Step::new(0, json!({"api": "a", "v": 1}))], lbl);

        let text = episodes_to_jsonl(&[episode]).unwrap();
        let expected = concat!(
            "{\"labels\":{\"critical_steps\":[0],\"episode_id\":0,",
            "\"per_step_utility\":{\"0\":1.5},\"total_drift_events\":1},",
            "\"steps\":[{\"metadata\":{},\"observation\":{\"api\":\"a\",\"v\":1},\"t\":0}]}\n",
        );
        assert_eq!(text, expected);
    }
}
