//! Byte-budgeted memory store and action protocol
//!
//! The store owns every retained item and is the only mutation path:
//! policies describe intent as [`MemoryAction`]s and the store validates
//! and applies them atomically. After every successful action the
//! following hold:
//!
//! - I1: the sum of item byte costs equals `bytes_used`, which never
//!   exceeds `max_bytes`
//! - I2: every DELTA's parent timestep is present and holds a BASE item
//! - I3: a DELTA never chains to another DELTA
//! - I4: a DELTA and its BASE parent carry equal `api` values
//! - I5: at most one item per timestep
//!
//! Rejected actions leave the store byte-for-byte unchanged.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::encoding::{delta_bytes, estimate_bytes};
use crate::episode::Step;

/// Tracks byte usage for memory writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteBudget {
    max_bytes: u64,
    used_bytes: u64,
}

impl ByteBudget {
    pub fn new(max_bytes: u64) -> Self {
        ByteBudget {
            max_bytes,
            used_bytes: 0,
        }
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes
    }

    pub fn remaining(&self) -> u64 {
        self.max_bytes - self.used_bytes
    }

    /// Charge `count` bytes; false (and no change) when it would exceed
    /// the cap
    pub fn try_consume(&mut self, count: u64) -> bool {
        if self.used_bytes + count > self.max_bytes {
            return false;
        }
        self.used_bytes += count;
        true
    }

    /// Refund `count` bytes, saturating at zero
    pub fn credit(&mut self, count: u64) {
        self.used_bytes = self.used_bytes.saturating_sub(count);
    }
}

/// Memory action emitted by a policy for one incoming step
///
/// Modeled as a tagged sum so each variant carries exactly the fields it
/// needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "UPPERCASE")]
pub enum MemoryAction {
    Skip,
    Write {
        step: Step,
    },
    Merge {
        step: Step,
        target_t: u64,
        /// Explicit delta; when omitted the store computes the canonical
        /// delta itself
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delta: Option<Map<String, Value>>,
    },
    Expire {
        target_t: u64,
    },
}

impl MemoryAction {
    pub fn kind(&self) -> &'static str {
        match self {
            MemoryAction::Skip => "SKIP",
            MemoryAction::Write { .. } => "WRITE",
            MemoryAction::Merge { .. } => "MERGE",
            MemoryAction::Expire { .. } => "EXPIRE",
        }
    }

    /// Expire/merge target, if the variant has one
    pub fn target_t(&self) -> Option<u64> {
        match self {
            MemoryAction::Merge { target_t, .. } | MemoryAction::Expire { target_t } => {
                Some(*target_t)
            }
            _ => None,
        }
    }
}

/// Whether an item is a full stored step or a delta update
#[derive(Debug, Clone, PartialEq)]
pub enum ItemKind {
    Base,
    Delta {
        /// Timestep of the BASE item this delta augments
        parent_t: u64,
        /// Canonical field-wise diff against the parent observation
        delta: Map<String, Value>,
    },
}

/// One retained item: the originating step plus accounting
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryItem {
    pub step: Step,
    pub written_at: u64,
    pub byte_cost: u64,
    pub kind: ItemKind,
}

impl MemoryItem {
    pub fn is_base(&self) -> bool {
        matches!(self.kind, ItemKind::Base)
    }

    pub fn parent_t(&self) -> Option<u64> {
        match self.kind {
            ItemKind::Base => None,
            ItemKind::Delta { parent_t, .. } => Some(parent_t),
        }
    }
}

/// Canonical delta between a base observation and an incoming one:
/// every key besides `api` that is new or changed, taken at its incoming
/// value.
pub fn compute_canonical_delta(
    base: &Map<String, Value>,
    incoming: &Map<String, Value>,
) -> Map<String, Value> {
    let mut delta = Map::new();
    for (key, value) in incoming {
        if key == "api" {
            continue;
        }
        if base.get(key) != Some(value) {
            delta.insert(key.clone(), value.clone());
        }
    }
    delta
}

/// In-memory store with byte-budget enforcement
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryStore {
    budget: ByteBudget,
    items: HashMap<u64, MemoryItem>,
    order: Vec<u64>,
    /// Backlink index: BASE timestep -> timesteps of surviving DELTA
    /// children
    children: HashMap<u64, BTreeSet<u64>>,
}

impl MemoryStore {
    pub fn new(max_bytes: u64) -> Self {
        MemoryStore {
            budget: ByteBudget::new(max_bytes),
            items: HashMap::new(),
            order: Vec::new(),
            children: HashMap::new(),
        }
    }

    pub fn remaining(&self) -> u64 {
        self.budget.remaining()
    }

    pub fn bytes_used(&self) -> u64 {
        self.budget.used_bytes()
    }

    pub fn max_bytes(&self) -> u64 {
        self.budget.max_bytes()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, t: u64) -> bool {
        self.items.contains_key(&t)
    }

    pub fn get(&self, t: u64) -> Option<&MemoryItem> {
        self.items.get(&t)
    }

    /// Items in insertion order
    pub fn items(&self) -> impl Iterator<Item = &MemoryItem> + '_ {
        self.order.iter().filter_map(|t| self.items.get(t))
    }

    /// Earliest-written surviving item
    pub fn oldest_item(&self) -> Option<&MemoryItem> {
        self.order.first().and_then(|t| self.items.get(t))
    }

    /// Read-only capability over this store for policies
    pub fn view(&self) -> StoreView<'_> {
        StoreView { store: self }
    }

    /// Apply one action at timestep `current_t`.
    ///
    /// Returns true on success, false on rejection; a rejected action
    /// leaves budget, items, and ordering untouched.
    pub fn apply(&mut self, action: &MemoryAction, current_t: u64) -> bool {
        match action {
            MemoryAction::Skip => true,
            MemoryAction::Write { step } => self.write(step),
            MemoryAction::Merge {
                step,
                target_t,
                delta,
            } => self.merge(*target_t, step, delta.as_ref()),
            MemoryAction::Expire { target_t } => {
                if *target_t >= current_t {
                    return false;
                }
                self.expire(*target_t)
            }
        }
    }

    fn write(&mut self, step: &Step) -> bool {
        if self.items.contains_key(&step.t) {
            return false;
        }
        let cost = estimate_bytes(step);
        if !self.budget.try_consume(cost) {
            return false;
        }
        self.items.insert(
            step.t,
            MemoryItem {
                step: step.clone(),
                written_at: step.t,
                byte_cost: cost,
                kind: ItemKind::Base,
            },
        );
        self.order.push(step.t);
        true
    }

    fn merge(&mut self, target_t: u64, step: &Step, supplied: Option<&Map<String, Value>>) -> bool {
        let base = match self.items.get(&target_t) {
            Some(item) => item,
            None => return false,
        };
        // No delta chains: the target must be a BASE item.
        if !base.is_base() {
            return false;
        }
        let base_obs = match base.step.observation.as_object() {
            Some(obs) => obs,
            None => return false,
        };
        let new_obs = match step.observation.as_object() {
            Some(obs) => obs,
            None => return false,
        };
        // Endpoint identity: both observations must carry the same
        // non-null `api`.
        let base_api = match base_obs.get("api").filter(|v| !v.is_null()) {
            Some(api) => api,
            None => return false,
        };
        let new_api = match new_obs.get("api").filter(|v| !v.is_null()) {
            Some(api) => api,
            None => return false,
        };
        if base_api != new_api {
            return false;
        }

        let canonical = compute_canonical_delta(base_obs, new_obs);
        if let Some(supplied) = supplied {
            if *supplied != canonical {
                return false;
            }
        }
        // A no-op merge would retain a timestep nearly for free.
        if canonical.is_empty() {
            return false;
        }
        if self.items.contains_key(&step.t) {
            return false;
        }
        let cost = delta_bytes(&canonical);
        if !self.budget.try_consume(cost) {
            return false;
        }

        self.items.insert(
            step.t,
            MemoryItem {
                step: step.clone(),
                written_at: step.t,
                byte_cost: cost,
                kind: ItemKind::Delta {
                    parent_t: target_t,
                    delta: canonical,
                },
            },
        );
        self.order.push(step.t);
        self.children.entry(target_t).or_default().insert(step.t);
        true
    }

    fn expire(&mut self, target_t: u64) -> bool {
        let item = match self.items.get(&target_t) {
            Some(item) => item,
            None => return false,
        };
        // A BASE with surviving deltas may not expire; the children must
        // go first.
        if item.is_base()
            && self
                .children
                .get(&target_t)
                .is_some_and(|kids| !kids.is_empty())
        {
            return false;
        }

        let Some(item) = self.items.remove(&target_t) else {
            return false;
        };
        self.order.retain(|&t| t != target_t);
        self.budget.credit(item.byte_cost);
        if let ItemKind::Delta { parent_t, .. } = item.kind {
            if let Some(kids) = self.children.get_mut(&parent_t) {
                kids.remove(&target_t);
                if kids.is_empty() {
                    self.children.remove(&parent_t);
                }
            }
        }
        true
    }

    /// Drop all items and reset accounting
    pub fn clear(&mut self) {
        self.items.clear();
        self.order.clear();
        self.children.clear();
        self.budget = ByteBudget::new(self.budget.max_bytes());
    }

    /// Post-apply consistency check; a failure here is an implementation
    /// bug, not a policy error.
    pub fn verify_invariants(&self) -> Result<(), String> {
        let cost_sum: u64 = self.items.values().map(|item| item.byte_cost).sum();
        if cost_sum != self.budget.used_bytes() {
            return Err(format!(
                "byte accounting drift: items sum to {} but budget says {}",
                cost_sum,
                self.budget.used_bytes()
            ));
        }
        if self.budget.used_bytes() > self.budget.max_bytes() {
            return Err(format!(
                "budget overrun: {} used of {} max",
                self.budget.used_bytes(),
                self.budget.max_bytes()
            ));
        }
        if self.order.len() != self.items.len() {
            return Err(format!(
                "ordering index has {} entries for {} items",
                self.order.len(),
                self.items.len()
            ));
        }
        let mut seen = BTreeSet::new();
        for &t in &self.order {
            if !seen.insert(t) {
                return Err(format!("duplicate timestep {t} in ordering index"));
            }
            if !self.items.contains_key(&t) {
                return Err(format!("ordering index references missing timestep {t}"));
            }
        }
        for item in self.items.values() {
            if let ItemKind::Delta { parent_t, .. } = &item.kind {
                let parent = self
                    .items
                    .get(parent_t)
                    .ok_or_else(|| format!("delta at {} orphaned from {}", item.step.t, parent_t))?;
                if !parent.is_base() {
                    return Err(format!(
                        "delta at {} chains to delta at {}",
                        item.step.t, parent_t
                    ));
                }
                if item.step.api() != parent.step.api() {
                    return Err(format!(
                        "delta at {} disagrees with parent {} on endpoint identity",
                        item.step.t, parent_t
                    ));
                }
                let linked = self
                    .children
                    .get(parent_t)
                    .is_some_and(|kids| kids.contains(&item.step.t));
                if !linked {
                    return Err(format!(
                        "backlink index missing delta {} under parent {}",
                        item.step.t, parent_t
                    ));
                }
            }
        }
        for (parent_t, kids) in &self.children {
            for kid in kids {
                let ok = self
                    .items
                    .get(kid)
                    .is_some_and(|item| item.parent_t() == Some(*parent_t));
                if !ok {
                    return Err(format!(
                        "backlink index lists stale delta {kid} under parent {parent_t}"
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Read-only view of the store handed to policies
///
/// Exposes exactly the query surface a policy needs; all mutation goes
/// through returned actions.
#[derive(Clone, Copy)]
pub struct StoreView<'a> {
    store: &'a MemoryStore,
}

impl<'a> StoreView<'a> {
    pub fn remaining(&self) -> u64 {
        self.store.remaining()
    }

    pub fn bytes_used(&self) -> u64 {
        self.store.bytes_used()
    }

    pub fn max_bytes(&self) -> u64 {
        self.store.max_bytes()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn contains(&self, t: u64) -> bool {
        self.store.contains(t)
    }

    pub fn get(&self, t: u64) -> Option<&'a MemoryItem> {
        self.store.get(t)
    }

    pub fn oldest_item(&self) -> Option<&'a MemoryItem> {
        self.store.oldest_item()
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a MemoryItem> + 'a {
        self.store.items()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(t: u64, obs: Value) -> Step {
        Step::new(t, obs)
    }

    fn write(store: &mut MemoryStore, s: &Step) -> bool {
        store.apply(&MemoryAction::Write { step: s.clone() }, s.t)
    }

    #[test]
    fn write_charges_estimate_and_inserts_base() {
        let mut store = MemoryStore::new(10_000);
        let s = step(0, json!({"api": "x", "v": 1}));
        assert!(write(&mut store, &s));
        assert_eq!(store.bytes_used(), estimate_bytes(&s));
        assert!(store.get(0).unwrap().is_base());
        store.verify_invariants().unwrap();
    }

    #[test]
    fn write_rejects_duplicate_timestep() {
        let mut store = MemoryStore::new(10_000);
        let s = step(0, json!({"api": "x", "v": 1}));
        assert!(write(&mut store, &s));
        let used = store.bytes_used();
        assert!(!write(&mut store, &s));
        assert_eq!(store.bytes_used(), used);
    }

    #[test]
    fn write_rejects_when_over_budget() {
        let mut store = MemoryStore::new(10);
        assert!(!write(&mut store, &step(0, json!({"api": "x"}))));
        assert_eq!(store.bytes_used(), 0);
        assert!(store.is_empty());
    }

    #[test]
    fn zero_budget_rejects_writes_but_skip_succeeds() {
        let mut store = MemoryStore::new(0);
        assert!(store.apply(&MemoryAction::Skip, 0));
        assert!(!write(&mut store, &step(0, json!({"api": "x"}))));
        assert!(!store.apply(&MemoryAction::Expire { target_t: 0 }, 1));
    }

    #[test]
    fn merge_requires_existing_base() {
        let mut store = MemoryStore::new(10_000);
        let incoming = step(0, json!({"api": "a", "params": ["x"], "version": 1}));
        let ok = store.apply(
            &MemoryAction::Merge {
                step: incoming,
                target_t: 0,
                delta: None,
            },
            0,
        );
        assert!(!ok);
    }

    #[test]
    fn merge_requires_same_api() {
        let mut store = MemoryStore::new(10_000);
        assert!(write(&mut store, &step(0, json!({"api": "a", "v": 1}))));
        let incoming = step(1, json!({"api": "b", "v": 2}));
        let ok = store.apply(
            &MemoryAction::Merge {
                step: incoming,
                target_t: 0,
                delta: None,
            },
            1,
        );
        assert!(!ok);
    }

    #[test]
    fn merge_rejects_null_api() {
        let mut store = MemoryStore::new(10_000);
        assert!(write(&mut store, &step(0, json!({"api": null, "v": 1}))));
        let incoming = step(1, json!({"api": null, "v": 2}));
        let ok = store.apply(
            &MemoryAction::Merge {
                step: incoming,
                target_t: 0,
                delta: None,
            },
            1,
        );
        assert!(!ok);
    }

    #[test]
    fn merge_rejects_empty_delta() {
        let mut store = MemoryStore::new(10_000);
        assert!(write(&mut store, &step(0, json!({"api": "a", "v": 1}))));
        // Identical observation -> canonical delta is empty.
        let incoming = step(1, json!({"api": "a", "v": 1}));
        let ok = store.apply(
            &MemoryAction::Merge {
                step: incoming,
                target_t: 0,
                delta: None,
            },
            1,
        );
        assert!(!ok);
    }

    #[test]
    fn merge_rejects_delta_mismatch() {
        let mut store = MemoryStore::new(10_000);
        assert!(write(&mut store, &step(0, json!({"api": "a", "v": 1}))));
        let incoming = step(1, json!({"api": "a", "v": 2}));
        let wrong = match json!({"version": 2}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let ok = store.apply(
            &MemoryAction::Merge {
                step: incoming,
                target_t: 0,
                delta: Some(wrong),
            },
            1,
        );
        assert!(!ok);
    }

    #[test]
    fn merge_accepts_canonical_delta_and_charges_delta_bytes() {
        let mut store = MemoryStore::new(10_000);
        let base = step(0, json!({"api": "a", "v": 1, "p": ["a"]}));
        assert!(write(&mut store, &base));
        let incoming = step(1, json!({"api": "a", "v": 2, "p": ["a"]}));
        let ok = store.apply(
            &MemoryAction::Merge {
                step: incoming.clone(),
                target_t: 0,
                delta: None,
            },
            1,
        );
        assert!(ok);

        let delta = match json!({"v": 2}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        assert_eq!(
            store.bytes_used(),
            estimate_bytes(&base) + delta_bytes(&delta)
        );
        let item = store.get(1).unwrap();
        assert_eq!(item.parent_t(), Some(0));
        store.verify_invariants().unwrap();
    }

    #[test]
    fn merge_to_delta_is_rejected() {
        let mut store = MemoryStore::new(10_000);
        assert!(write(&mut store, &step(0, json!({"api": "a", "v": 1}))));
        let first = step(1, json!({"api": "a", "v": 2}));
        assert!(store.apply(
            &MemoryAction::Merge {
                step: first,
                target_t: 0,
                delta: None,
            },
            1,
        ));
        // Chaining onto the delta at t=1 must fail.
        let second = step(2, json!({"api": "a", "v": 3}));
        let ok = store.apply(
            &MemoryAction::Merge {
                step: second,
                target_t: 1,
                delta: None,
            },
            2,
        );
        assert!(!ok);
    }

    #[test]
    fn expire_requires_strictly_older_target() {
        let mut store = MemoryStore::new(10_000);
        assert!(write(&mut store, &step(3, json!({"api": "a"}))));
        assert!(!store.apply(&MemoryAction::Expire { target_t: 3 }, 3));
        assert!(store.apply(&MemoryAction::Expire { target_t: 3 }, 4));
        assert_eq!(store.bytes_used(), 0);
    }

    #[test]
    fn expire_of_base_with_surviving_delta_is_rejected() {
        let mut store = MemoryStore::new(10_000);
        assert!(write(&mut store, &step(0, json!({"api": "a", "v": 1}))));
        assert!(store.apply(
            &MemoryAction::Merge {
                step: step(1, json!({"api": "a", "v": 2})),
                target_t: 0,
                delta: None,
            },
            1,
        ));
        assert!(!store.apply(&MemoryAction::Expire { target_t: 0 }, 2));
        // Child first, then the base.
        assert!(store.apply(&MemoryAction::Expire { target_t: 1 }, 2));
        assert!(store.apply(&MemoryAction::Expire { target_t: 0 }, 2));
        assert_eq!(store.bytes_used(), 0);
        store.verify_invariants().unwrap();
    }

    #[test]
    fn rejection_leaves_store_unchanged() {
        let mut store = MemoryStore::new(200);
        assert!(write(&mut store, &step(0, json!({"api": "a", "v": 1}))));
        let snapshot = store.clone();

        // Oversized write.
        let huge = step(1, json!({"api": "a", "blob": "x".repeat(500)}));
        assert!(!write(&mut store, &huge));
        assert_eq!(store, snapshot);

        // Missing expire target.
        assert!(!store.apply(&MemoryAction::Expire { target_t: 42 }, 5));
        assert_eq!(store, snapshot);
    }

    #[test]
    fn canonical_delta_includes_new_and_changed_keys_only() {
        let base = match json!({"api": "a", "v": 1, "keep": true}) {
            Value::Object(m) => m,
            _ => unreachable!(),
        };
        let incoming = match json!({"api": "a", "v": 2, "keep": true, "added": [1]}) {
            Value::Object(m) => m,
            _ => unreachable!(),
        };
        let delta = compute_canonical_delta(&base, &incoming);
        assert_eq!(
            Value::Object(delta),
            json!({"v": 2, "added": [1]})
        );
    }

    #[test]
    fn oldest_item_follows_insertion_order() {
        let mut store = MemoryStore::new(10_000);
        assert!(write(&mut store, &step(5, json!({"api": "a"}))));
        assert!(write(&mut store, &step(7, json!({"api": "b"}))));
        assert_eq!(store.oldest_item().unwrap().step.t, 5);
        assert!(store.apply(&MemoryAction::Expire { target_t: 5 }, 8));
        assert_eq!(store.oldest_item().unwrap().step.t, 7);
    }
}
