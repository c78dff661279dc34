//! WritePolicyBench CLI
//!
//! Runs the evaluator over a frozen episode manifest, and generates
//! (freezes) the synthetic episode sets the manifest describes.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use writepolicybench::episode_io::{
    file_sha256, load_episodes, load_manifest, resolve_set_path, verify_manifest, write_episodes,
    write_manifest, EpisodeSetEntry, Manifest,
};
use writepolicybench::error::{BenchError, Result};
use writepolicybench::evaluator::{
    run_grid, write_action_log, write_results_csv, GridConfig, DEFAULT_BUDGETS,
};
use writepolicybench::policy::Track;
use writepolicybench::synthetic::{generate_episodes, DriftConfig, Mode};

#[derive(Parser)]
#[command(name = "writepolicybench")]
#[command(about = "Memory write policy benchmark")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate policies over a frozen episode manifest
    Run {
        /// Path to the episode manifest
        #[arg(long, env = "WPB_MANIFEST")]
        manifest: PathBuf,
        /// Results table output path
        #[arg(long)]
        out: PathBuf,
        /// Budget grid in bytes (comma-separated)
        #[arg(long, value_delimiter = ',')]
        budgets: Vec<u64>,
        /// Policy ids (comma-separated; default: per-track standard set)
        #[arg(long, value_delimiter = ',')]
        policies: Vec<String>,
        /// Tracks to evaluate (comma-separated)
        #[arg(long, value_delimiter = ',')]
        tracks: Vec<String>,
        /// Optional per-condition action log (JSONL)
        #[arg(long)]
        action_log: Option<PathBuf>,
    },
    /// Generate and freeze synthetic episode sets plus their manifest
    Freeze {
        /// Output directory for episode files and MANIFEST.json
        #[arg(long, default_value = "data/episodes")]
        out_dir: PathBuf,
        /// Episodes per set
        #[arg(long, default_value_t = 10)]
        episodes: u64,
        /// Steps per episode
        #[arg(long, default_value_t = 200)]
        steps: u64,
        /// Generator seed
        #[arg(long, default_value_t = 0)]
        seed: u64,
        /// Drift regimes to generate (comma-separated; default: all)
        #[arg(long, value_delimiter = ',')]
        modes: Vec<String>,
    },
}

fn parse_tracks(raw: &[String]) -> Result<Vec<Track>> {
    if raw.is_empty() {
        return Ok(Track::all().to_vec());
    }
    raw.iter()
        .map(|s| s.parse::<Track>().map_err(BenchError::InvalidInput))
        .collect()
}

fn parse_modes(raw: &[String]) -> Result<Vec<Mode>> {
    if raw.is_empty() {
        return Ok(Mode::all().to_vec());
    }
    raw.iter()
        .map(|s| s.parse::<Mode>().map_err(BenchError::InvalidInput))
        .collect()
}

fn cmd_run(
    manifest_path: &Path,
    out: &Path,
    budgets: Vec<u64>,
    policies: Vec<String>,
    tracks: Vec<String>,
    action_log: Option<&Path>,
) -> Result<()> {
    let manifest = load_manifest(manifest_path)?;
    let manifest_dir = manifest_path.parent().unwrap_or_else(|| Path::new("."));
    verify_manifest(&manifest, manifest_dir)?;

    let mut sets = Vec::new();
    for (name, entry) in &manifest.episode_sets {
        let path = resolve_set_path(manifest_dir, entry);
        sets.push((name.clone(), load_episodes(path)?));
    }

    let config = GridConfig {
        budgets: if budgets.is_empty() {
            DEFAULT_BUDGETS.to_vec()
        } else {
            budgets
        },
        policies,
        tracks: parse_tracks(&tracks)?,
    };

    let (rows, logs) = run_grid(&sets, &config)?;
    write_results_csv(out, &rows)?;
    if let Some(log_path) = action_log {
        write_action_log(log_path, &logs)?;
    }
    info!(rows = rows.len(), out = %out.display(), "wrote results table");
    Ok(())
}

fn cmd_freeze(
    out_dir: &Path,
    episode_count: u64,
    steps: u64,
    seed: u64,
    modes: Vec<String>,
) -> Result<()> {
    let modes = parse_modes(&modes)?;
    let mut manifest = Manifest::new();
    manifest.extra.insert("seed".into(), json!(seed));
    manifest.extra.insert("steps".into(), json!(steps));
    manifest.extra.insert("episodes".into(), json!(episode_count));
    manifest.extra.insert(
        "modes".into(),
        json!(modes.iter().map(Mode::as_str).collect::<Vec<_>>()),
    );

    for mode in modes {
        let config = DriftConfig {
            steps,
            seed,
            mode,
            ..Default::default()
        };
        let episodes = generate_episodes(episode_count, &config);
        let file_name = format!(
            "episodes__schema=priority_v1__mode={mode}__seed={seed}__steps={steps}__n={episode_count}.jsonl"
        );
        let path = out_dir.join(&file_name);
        write_episodes(&path, &episodes)?;
        manifest.episode_sets.insert(
            mode.as_str().to_string(),
            EpisodeSetEntry {
                path: file_name,
                sha256: file_sha256(&path)?,
                records: episode_count,
            },
        );
        info!(mode = %mode, path = %path.display(), "froze episode set");
    }

    write_manifest(out_dir.join("MANIFEST.json"), &manifest)?;
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            manifest,
            out,
            budgets,
            policies,
            tracks,
            action_log,
        } => cmd_run(
            &manifest,
            &out,
            budgets,
            policies,
            tracks,
            action_log.as_deref(),
        ),
        Commands::Freeze {
            out_dir,
            episodes,
            steps,
            seed,
            modes,
        } => cmd_freeze(&out_dir, episodes, steps, seed, modes),
    }
}
