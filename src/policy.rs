//! Write policy interface and evaluation tracks
//!
//! A policy sees one step at a time plus a read-only view of the store,
//! and answers with zero or more memory actions. What the policy sees is
//! track-dependent: the evaluator strips step metadata down to a per-track
//! allow-list before the policy (or the store) ever touches the step, so
//! supervision signals such as per-step utility can never leak.

use sha2::{Digest, Sha256};

use crate::episode::Step;
use crate::memory::{MemoryAction, StoreView};

/// Whether the policy may read the `priority` hint in step metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Track {
    #[default]
    Unprivileged,
    Privileged,
}

/// Metadata keys visible on the unprivileged track
pub const UNPRIVILEGED_METADATA_KEYS: &[&str] = &["mode"];

/// Metadata keys visible on the privileged track
pub const PRIVILEGED_METADATA_KEYS: &[&str] = &["mode", "priority"];

impl Track {
    pub fn as_str(&self) -> &'static str {
        match self {
            Track::Unprivileged => "unprivileged",
            Track::Privileged => "privileged",
        }
    }

    pub fn all() -> &'static [Track] {
        &[Track::Unprivileged, Track::Privileged]
    }

    /// Metadata allow-list for this track
    pub fn visible_keys(&self) -> &'static [&'static str] {
        match self {
            Track::Unprivileged => UNPRIVILEGED_METADATA_KEYS,
            Track::Privileged => PRIVILEGED_METADATA_KEYS,
        }
    }
}

impl std::fmt::Display for Track {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Track {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "unprivileged" => Ok(Track::Unprivileged),
            "privileged" => Ok(Track::Privileged),
            _ => Err(format!("Unknown track: {}", s)),
        }
    }
}

/// Project a step down to what the given track may see.
///
/// The view step is also the cost model: what a WRITE stores (and is
/// charged for) is the stripped step, not the raw one.
pub fn policy_view(step: &Step, track: Track) -> Step {
    let mut metadata = serde_json::Map::new();
    for key in track.visible_keys() {
        if let Some(value) = step.metadata.get(*key) {
            metadata.insert((*key).to_string(), value.clone());
        }
    }
    Step::with_metadata(step.t, step.observation.clone(), metadata)
}

/// Select one or more memory actions for a single incoming step.
///
/// Implementations are constructed fresh per (episode, budget, track)
/// condition, may keep internal state across steps, and must tolerate any
/// of their actions being rejected. All store mutation happens through
/// the returned actions; the view is read-only and must not be retained
/// beyond the call.
pub trait WritePolicy {
    fn select(&mut self, step: &Step, store: &StoreView<'_>) -> Vec<MemoryAction>;
}

/// Deterministic per-condition seed for randomized policies.
///
/// Derived by hashing the condition identity so reruns of the same
/// (episode, budget, policy, track) grid cell reproduce byte-identical
/// results.
pub fn condition_seed(episode_id: &str, budget_bytes: u64, policy_id: &str, track: Track) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(episode_id.as_bytes());
    hasher.update([0]);
    hasher.update(budget_bytes.to_le_bytes());
    hasher.update(policy_id.as_bytes());
    hasher.update([0]);
    hasher.update(track.as_str().as_bytes());
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(prefix)
}
