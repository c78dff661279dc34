//! Baseline write policies
//!
//! The evaluator only knows the [`WritePolicy`] interface; these are the
//! stock implementations it ships with, addressable by id. All of them
//! tolerate rejection: they never assume a previously emitted action was
//! accepted.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;

use crate::encoding::{delta_bytes, estimate_bytes};
use crate::episode::Step;
use crate::error::{BenchError, Result};
use crate::memory::{compute_canonical_delta, MemoryAction, MemoryItem, StoreView};
use crate::policy::{Track, WritePolicy};

/// Default policy ids per track, mirroring the benchmark's standard grid
pub fn default_policies(track: Track) -> &'static [&'static str] {
    match track {
        Track::Unprivileged => &[
            "no_mem",
            "fifo_store_all",
            "uniform_sample",
            "last_kb",
            "merge_aggressive",
        ],
        Track::Privileged => &[
            "no_mem",
            "fifo_store_all",
            "uniform_sample",
            "priority_threshold",
            "priority_greedy",
            "last_kb",
            "merge_aggressive",
        ],
    }
}

/// Construct a policy by id.
///
/// `seed` is the deterministic per-condition seed; only randomized
/// policies consume it.
pub fn build_policy(id: &str, seed: u64) -> Result<Box<dyn WritePolicy>> {
    match id {
        "no_mem" => Ok(Box::new(NoMem)),
        "fifo_store_all" => Ok(Box::new(FifoStoreAll)),
        "uniform_sample" => Ok(Box::new(UniformSample { every_n: 10 })),
        "last_kb" => Ok(Box::new(LastKb)),
        "merge_aggressive" => Ok(Box::new(MergeAggressive)),
        "priority_threshold" => Ok(Box::new(PriorityThreshold { threshold: 0.5 })),
        "priority_greedy" => Ok(Box::new(PriorityGreedy)),
        "random_sample" => Ok(Box::new(RandomSample::new(0.5, seed))),
        other => Err(BenchError::UnknownPolicy(other.to_string())),
    }
}

fn step_priority(step: &Step) -> f64 {
    step.metadata
        .get("priority")
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
}

/// Plan EXPIREs freeing at least `needed` bytes, oldest first.
///
/// A BASE with surviving deltas cannot expire directly, so its children
/// are scheduled ahead of it. `protect` exempts one timestep (a merge
/// target) from eviction. Returns None when the store cannot free enough.
fn eviction_plan(view: &StoreView<'_>, needed: u64, protect: Option<u64>) -> Option<Vec<MemoryAction>> {
    let mut actions = Vec::new();
    let mut scheduled = BTreeSet::new();
    let mut freed: u64 = 0;

    let items: Vec<&MemoryItem> = view.iter().collect();
    for item in &items {
        if freed >= needed {
            break;
        }
        let t = item.step.t;
        if scheduled.contains(&t) || protect == Some(t) {
            continue;
        }
        if item.is_base() {
            // Children first; they are always younger than the base.
            for child in items.iter().filter(|i| i.parent_t() == Some(t)) {
                if scheduled.insert(child.step.t) {
                    actions.push(MemoryAction::Expire {
                        target_t: child.step.t,
                    });
                    freed += child.byte_cost;
                }
            }
        }
        scheduled.insert(t);
        actions.push(MemoryAction::Expire { target_t: t });
        freed += item.byte_cost;
    }

    if freed >= needed {
        Some(actions)
    } else {
        None
    }
}

/// Evict oldest items until the incoming step fits, then write it
fn last_kb_actions(step: &Step, view: &StoreView<'_>) -> Vec<MemoryAction> {
    let cost = estimate_bytes(step);
    let remaining = view.remaining();
    if cost <= remaining {
        return vec![MemoryAction::Write { step: step.clone() }];
    }
    match eviction_plan(view, cost - remaining, None) {
        Some(mut actions) => {
            actions.push(MemoryAction::Write { step: step.clone() });
            actions
        }
        // Oversize step: even an empty store would not fit it.
        None => vec![MemoryAction::Skip],
    }
}

/// Never writes anything
pub struct NoMem;

impl WritePolicy for NoMem {
    fn select(&mut self, _step: &Step, _store: &StoreView<'_>) -> Vec<MemoryAction> {
        vec![MemoryAction::Skip]
    }
}

/// Write every step that fits; never evict
pub struct FifoStoreAll;

impl WritePolicy for FifoStoreAll {
    fn select(&mut self, step: &Step, store: &StoreView<'_>) -> Vec<MemoryAction> {
        if estimate_bytes(step) <= store.remaining() {
            vec![MemoryAction::Write { step: step.clone() }]
        } else {
            vec![MemoryAction::Skip]
        }
    }
}

/// Write every Nth timestep when it fits
pub struct UniformSample {
    pub every_n: u64,
}

impl WritePolicy for UniformSample {
    fn select(&mut self, step: &Step, store: &StoreView<'_>) -> Vec<MemoryAction> {
        if self.every_n == 0 || step.t % self.every_n != 0 {
            return vec![MemoryAction::Skip];
        }
        if estimate_bytes(step) <= store.remaining() {
            vec![MemoryAction::Write { step: step.clone() }]
        } else {
            vec![MemoryAction::Skip]
        }
    }
}

/// Keep the most recent window: expire oldest items to make room
pub struct LastKb;

impl WritePolicy for LastKb {
    fn select(&mut self, step: &Step, store: &StoreView<'_>) -> Vec<MemoryAction> {
        last_kb_actions(step, store)
    }
}

/// Write steps whose priority hint clears a threshold (privileged track)
pub struct PriorityThreshold {
    pub threshold: f64,
}

impl WritePolicy for PriorityThreshold {
    fn select(&mut self, step: &Step, _store: &StoreView<'_>) -> Vec<MemoryAction> {
        if step_priority(step) > self.threshold {
            vec![MemoryAction::Write { step: step.clone() }]
        } else {
            vec![MemoryAction::Skip]
        }
    }
}

/// Greedy priority replacement (privileged track).
///
/// Online approximation to "keep the highest-priority steps": write when
/// the step fits; otherwise evict lowest-priority items (tie-break by
/// age) when the incoming priority beats the lowest priority present.
pub struct PriorityGreedy;

impl WritePolicy for PriorityGreedy {
    fn select(&mut self, step: &Step, store: &StoreView<'_>) -> Vec<MemoryAction> {
        let cost = estimate_bytes(step);
        let remaining = store.remaining();
        if cost <= remaining {
            return vec![MemoryAction::Write { step: step.clone() }];
        }

        let items: Vec<&MemoryItem> = store.iter().collect();
        if items.is_empty() {
            return vec![MemoryAction::Skip];
        }

        let incoming = step_priority(step);
        let lowest = items
            .iter()
            .map(|item| step_priority(&item.step))
            .fold(f64::INFINITY, f64::min);
        if incoming <= lowest {
            return vec![MemoryAction::Skip];
        }

        let mut evictables = items.clone();
        evictables.sort_by(|a, b| {
            step_priority(&a.step)
                .partial_cmp(&step_priority(&b.step))
                .unwrap_or(Ordering::Equal)
                .then(a.step.t.cmp(&b.step.t))
        });

        let mut actions = Vec::new();
        let mut scheduled = BTreeSet::new();
        let mut freed: u64 = 0;
        for item in &evictables {
            let t = item.step.t;
            if scheduled.contains(&t) {
                continue;
            }
            if item.is_base() {
                for child in items.iter().filter(|i| i.parent_t() == Some(t)) {
                    if scheduled.insert(child.step.t) {
                        actions.push(MemoryAction::Expire {
                            target_t: child.step.t,
                        });
                        freed += child.byte_cost;
                    }
                }
            }
            scheduled.insert(t);
            actions.push(MemoryAction::Expire { target_t: t });
            freed += item.byte_cost;
            if cost <= remaining + freed {
                actions.push(MemoryAction::Write { step: step.clone() });
                return actions;
            }
        }

        vec![MemoryAction::Skip]
    }
}

/// Prefer MERGE into the most recent BASE with the same endpoint
pub struct MergeAggressive;

impl WritePolicy for MergeAggressive {
    fn select(&mut self, step: &Step, store: &StoreView<'_>) -> Vec<MemoryAction> {
        let Some(api) = step.api() else {
            return last_kb_actions(step, store);
        };
        let Some(new_obs) = step.observation.as_object() else {
            return last_kb_actions(step, store);
        };

        let target = store
            .iter()
            .filter(|item| item.is_base() && item.step.api() == Some(api))
            .last();
        let Some(target) = target else {
            return last_kb_actions(step, store);
        };
        let Some(base_obs) = target.step.observation.as_object() else {
            return last_kb_actions(step, store);
        };

        let delta = compute_canonical_delta(base_obs, new_obs);
        if delta.is_empty() {
            // Identical snapshot; nothing worth retaining.
            return vec![MemoryAction::Skip];
        }

        let cost = delta_bytes(&delta);
        let remaining = store.remaining();
        let target_t = target.step.t;
        let merge = MemoryAction::Merge {
            step: step.clone(),
            target_t,
            delta: Some(delta),
        };
        if cost <= remaining {
            return vec![merge];
        }
        match eviction_plan(store, cost - remaining, Some(target_t)) {
            Some(mut actions) => {
                actions.push(merge);
                actions
            }
            None => vec![MemoryAction::Skip],
        }
    }
}

/// Seeded coin-flip writer; exercises per-condition seeding
pub struct RandomSample {
    p: f64,
    rng: StdRng,
}

impl RandomSample {
    pub fn new(p: f64, seed: u64) -> Self {
        RandomSample {
            p,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl WritePolicy for RandomSample {
    fn select(&mut self, step: &Step, store: &StoreView<'_>) -> Vec<MemoryAction> {
        let chosen = self.rng.gen::<f64>() < self.p;
        if chosen && estimate_bytes(step) <= store.remaining() {
            vec![MemoryAction::Write { step: step.clone() }]
        } else {
            vec![MemoryAction::Skip]
        }
    }
}
