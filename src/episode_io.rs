//! Episode stream and manifest IO
//!
//! Episodes travel as line-delimited records in the canonical encoding,
//! one episode per line. Loading is all-or-nothing: the first malformed
//! record fails the load with its record index. Frozen episode sets are
//! described by a manifest carrying a content hash and record count per
//! set; the evaluator refuses to run against a manifest that no longer
//! matches the files on disk.

use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::encoding::canonical_string;
use crate::episode::Episode;
use crate::error::{BenchError, Result};

/// Load every episode from a JSONL stream; no partial loads.
///
/// Blank lines are skipped; any other malformed record aborts the load
/// with its 0-based record index.
pub fn load_episodes(path: impl AsRef<Path>) -> Result<Vec<Episode>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)?;
    let mut episodes = Vec::new();
    let mut index = 0usize;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let episode: Episode =
            serde_json::from_str(line).map_err(|err| BenchError::MalformedEpisode {
                index,
                message: err.to_string(),
            })?;
        episode
            .validate()
            .map_err(|message| BenchError::MalformedEpisode { index, message })?;
        episodes.push(episode);
        index += 1;
    }
    info!(path = %path.display(), episodes = episodes.len(), "loaded episode stream");
    Ok(episodes)
}

/// Serialize episodes as canonical JSONL
pub fn episodes_to_jsonl(episodes: &[Episode]) -> Result<String> {
    let mut out = String::new();
    for episode in episodes {
        let value = serde_json::to_value(episode)?;
        out.push_str(&canonical_string(&value));
        out.push('\n');
    }
    Ok(out)
}

/// Write episodes to a JSONL file in the canonical encoding.
///
/// Serializing a loaded stream and reloading it yields structurally equal
/// episodes.
pub fn write_episodes(path: impl AsRef<Path>, episodes: &[Episode]) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut writer = BufWriter::new(fs::File::create(path)?);
    writer.write_all(episodes_to_jsonl(episodes)?.as_bytes())?;
    writer.flush()?;
    Ok(())
}

/// One frozen episode set: where it lives and what it must contain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeSetEntry {
    /// Path relative to the manifest file
    pub path: String,
    /// Hex SHA-256 of the file contents
    pub sha256: String,
    /// Number of episode records
    pub records: u64,
}

/// Frozen episode manifest: logical set name -> entry, plus generator
/// provenance (seed, steps, modes, ...) in `extra`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub episode_sets: BTreeMap<String, EpisodeSetEntry>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Manifest {
    pub fn new() -> Self {
        Manifest {
            episode_sets: BTreeMap::new(),
            extra: Map::new(),
        }
    }
}

impl Default for Manifest {
    fn default() -> Self {
        Manifest::new()
    }
}

/// Hex SHA-256 of a file's bytes
pub fn file_sha256(path: impl AsRef<Path>) -> Result<String> {
    let bytes = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Number of non-blank records in a JSONL file
pub fn count_records(path: impl AsRef<Path>) -> Result<u64> {
    let text = fs::read_to_string(path)?;
    Ok(text.lines().filter(|line| !line.trim().is_empty()).count() as u64)
}

pub fn load_manifest(path: impl AsRef<Path>) -> Result<Manifest> {
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

pub fn write_manifest(path: impl AsRef<Path>, manifest: &Manifest) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let value = serde_json::to_value(manifest)?;
    fs::write(path, canonical_string(&value) + "\n")?;
    Ok(())
}

/// Resolve a manifest entry's path against the manifest's directory
pub fn resolve_set_path(manifest_dir: &Path, entry: &EpisodeSetEntry) -> PathBuf {
    let path = Path::new(&entry.path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        manifest_dir.join(path)
    }
}

/// Verify every set's content hash and record count; any mismatch refuses
/// the run.
pub fn verify_manifest(manifest: &Manifest, manifest_dir: &Path) -> Result<()> {
    for (name, entry) in &manifest.episode_sets {
        let path = resolve_set_path(manifest_dir, entry);
        let actual_hash = file_sha256(&path).map_err(|err| {
            BenchError::ManifestMismatch(format!(
                "set '{}' at {} is unreadable: {}",
                name,
                path.display(),
                err
            ))
        })?;
        if actual_hash != entry.sha256 {
            return Err(BenchError::ManifestMismatch(format!(
                "set '{}' content hash {} does not match manifest ({})",
                name, actual_hash, entry.sha256
            )));
        }
        let actual_records = count_records(&path)?;
        if actual_records != entry.records {
            return Err(BenchError::ManifestMismatch(format!(
                "set '{}' has {} records, manifest says {}",
                name, actual_records, entry.records
            )));
        }
    }
    Ok(())
}
