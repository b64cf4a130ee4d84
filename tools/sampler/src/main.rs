/// Sampling tool: builds the stratified grid and selects locations for the
/// acquisition service, either as one batch over the grid or incrementally
/// around anchor neighbourhoods against an existing registry.
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use census_core::config::CensusConfig;
use census_core::sampling::{
    sample_online, sample_online_parallel, stratified_sample, FillStatus, IdAllocator, Registry,
    SharedRegistry, StratumFill, StratumQuota,
};
use census_core::{classify_grid, create_grid, tables, GridCell};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "sampler", about = "Select stratified sample locations for image acquisition")]
struct Args {
    /// JSON config; built-in São Paulo calibration when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Tile the region and label every cell with its stratum
    Grid {
        #[arg(short, long, default_value = "data/grid.csv")]
        output: PathBuf,

        /// Override the configured cell size
        #[arg(long)]
        cell_size_km: Option<f64>,
    },

    /// Draw whole grid cells per stratum in one pass
    Batch {
        /// Registry written by the acquisition service; absent on a first run
        #[arg(short, long, default_value = "dataset/metadata.csv")]
        registry: PathBuf,

        #[arg(short, long, default_value = "data/manifest.csv")]
        output: PathBuf,

        #[arg(long)]
        total: Option<usize>,

        #[arg(long)]
        seed: Option<u64>,

        /// Also write per-stratum quotas as JSON
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Add locations around anchors, keeping clear of everything already registered
    Online {
        /// Registry written by the acquisition service; absent on a first run
        #[arg(short, long, default_value = "dataset/metadata.csv")]
        registry: PathBuf,

        #[arg(short, long, default_value = "data/online_manifest.csv")]
        output: PathBuf,

        #[arg(long)]
        per_stratum: Option<usize>,

        #[arg(long)]
        seed: Option<u64>,

        /// Run strata concurrently (not reproducible across runs)
        #[arg(long)]
        parallel: bool,

        /// Also write per-stratum fill accounting as JSON
        #[arg(long)]
        report: Option<PathBuf>,
    },
}

#[derive(Serialize)]
struct BatchReport<'a> {
    seed: u64,
    registry_before: usize,
    total_samples: usize,
    drawn: usize,
    quotas: &'a [StratumQuota],
}

#[derive(Serialize)]
struct OnlineReport<'a> {
    seed: u64,
    parallel: bool,
    registry_before: usize,
    accepted: usize,
    partial: bool,
    fills: &'a [StratumFill],
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn load_config(path: Option<&Path>) -> Result<CensusConfig> {
    let cfg = match path {
        Some(p) => CensusConfig::load(p).with_context(|| format!("Cannot load config {}", p.display()))?,
        None => CensusConfig::default(),
    };
    for w in cfg.validate().context("Configuration rejected")? {
        warn!("config: {w}");
    }
    Ok(cfg)
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).with_context(|| format!("Cannot create {}", dir.display()))?;
    }
    Ok(())
}

fn load_registry(path: &Path) -> Result<Registry> {
    let existing = if path.exists() {
        tables::read_registry(path)
            .with_context(|| format!("Cannot read registry {}", path.display()))?
    } else {
        warn!(path = %path.display(), "no registry yet, starting empty");
        Vec::new()
    };
    Ok(Registry::from_records(existing))
}

fn classified_grid(cfg: &CensusConfig, cell_size_km: f64) -> Vec<GridCell> {
    let r = &cfg.region;
    let cells = classify_grid(create_grid(r.bounds, cell_size_km, r.scale), &cfg.rule());
    info!(cells = cells.len(), cell_size_km, "grid built");
    cells
}

// ── Subcommands ──────────────────────────────────────────────────────────────

fn run_grid(cfg: &CensusConfig, output: &Path, cell_size_km: Option<f64>) -> Result<()> {
    let size = cell_size_km.unwrap_or(cfg.region.cell_size_km);
    if !(size > 0.0) {
        bail!("cell size must be > 0, got {size}");
    }
    let cells = classified_grid(cfg, size);
    if cells.is_empty() {
        warn!("region is smaller than one cell; grid is empty");
    }

    ensure_parent(output)?;
    tables::write_grid(output, &cells).with_context(|| format!("Cannot write {}", output.display()))?;

    eprintln!("[sampler] {} cells of {size} km → {}", cells.len(), output.display());
    for s in &cfg.strata {
        let stratum = Some(s.stratum());
        let n = cells.iter().filter(|c| c.stratum == stratum).count();
        eprintln!("  {:<16} {:>7}", s.label, n);
    }
    Ok(())
}

fn run_batch(
    cfg: &CensusConfig,
    registry_path: &Path,
    output: &Path,
    total: Option<usize>,
    seed: Option<u64>,
    report: Option<&Path>,
) -> Result<()> {
    let total = total.unwrap_or(cfg.batch.total_samples);
    let seed = seed.unwrap_or(cfg.batch.seed);
    let cells = classified_grid(cfg, cfg.region.cell_size_km);
    let mut registry = load_registry(registry_path)?;
    let registry_before = registry.len();
    let ids = IdAllocator::after(&registry);
    let min_sep = cfg.online.min_separation_m;
    let batch = stratified_sample(&cells, &cfg.strata, total, seed, &mut registry, &ids, min_sep);

    ensure_parent(output)?;
    tables::write_manifest(output, &batch.samples)
        .with_context(|| format!("Cannot write {}", output.display()))?;

    eprintln!(
        "[sampler] batch of {} (seed {seed}) against {registry_before} registered → {}",
        batch.samples.len(),
        output.display()
    );
    eprintln!(
        "  {:<16} {:>9} {:>9} {:>7} {:>10}",
        "stratum", "requested", "available", "drawn", "too_close"
    );
    for q in &batch.quotas {
        eprintln!(
            "  {:<16} {:>9} {:>9} {:>7} {:>10}",
            q.stratum.as_str(),
            q.requested,
            q.available,
            q.drawn,
            q.rejected_too_close
        );
    }
    if batch.is_partial() {
        let short: usize = batch.quotas.iter().map(|q| q.shortfall()).sum();
        eprintln!("  [warn] quotas only partly filled, {short} short");
    }

    if let Some(path) = report {
        ensure_parent(path)?;
        let r = BatchReport {
            seed,
            registry_before,
            total_samples: total,
            drawn: batch.samples.len(),
            quotas: &batch.quotas,
        };
        tables::write_json(path, &r).with_context(|| format!("Cannot write {}", path.display()))?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_online(
    cfg: &mut CensusConfig,
    registry_path: &Path,
    output: &Path,
    per_stratum: Option<usize>,
    seed: Option<u64>,
    parallel: bool,
    report: Option<&Path>,
) -> Result<()> {
    if let Some(n) = per_stratum {
        cfg.online.samples_per_stratum = n;
    }
    if let Some(s) = seed {
        cfg.online.seed = s;
    }

    let registry = load_registry(registry_path)?;
    let registry_before = registry.len();
    let ids = IdAllocator::after(&registry);
    let rule = cfg.rule();

    let outcome = if parallel {
        let shared = SharedRegistry::new(registry);
        sample_online_parallel(&shared, &ids, &cfg.strata, &rule, &cfg.online)
    } else {
        let mut registry = registry;
        sample_online(&mut registry, &ids, &cfg.strata, &rule, &cfg.online)
    };

    ensure_parent(output)?;
    tables::write_manifest(output, &outcome.samples)
        .with_context(|| format!("Cannot write {}", output.display()))?;

    eprintln!(
        "[sampler] {} new locations against {} registered → {}",
        outcome.samples.len(),
        registry_before,
        output.display()
    );
    eprintln!(
        "  {:<16} {:>9} {:>8} {:>9} {:>10} {:>11}  status",
        "stratum", "requested", "accepted", "attempts", "too_close", "off_stratum"
    );
    for f in &outcome.fills {
        let status = match f.status {
            FillStatus::Complete => "complete",
            FillStatus::BudgetExhausted => "budget exhausted",
            FillStatus::NoAnchors => "no anchors",
        };
        eprintln!(
            "  {:<16} {:>9} {:>8} {:>9} {:>10} {:>11}  {status}",
            f.stratum.as_str(),
            f.requested,
            f.accepted,
            f.attempts,
            f.rejected_too_close,
            f.rejected_off_stratum
        );
    }
    if outcome.is_partial() {
        eprintln!("  [warn] request only partly fulfilled, {} short", outcome.shortfall());
    }

    if let Some(path) = report {
        ensure_parent(path)?;
        let r = OnlineReport {
            seed: cfg.online.seed,
            parallel,
            registry_before,
            accepted: outcome.samples.len(),
            partial: outcome.is_partial(),
            fills: &outcome.fills,
        };
        tables::write_json(path, &r).with_context(|| format!("Cannot write {}", path.display()))?;
    }
    Ok(())
}

// ── Main ─────────────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let mut cfg = load_config(args.config.as_deref())?;

    match &args.command {
        Command::Grid { output, cell_size_km } => run_grid(&cfg, output, *cell_size_km),
        Command::Batch { registry, output, total, seed, report } => {
            run_batch(&cfg, registry, output, *total, *seed, report.as_deref())
        }
        Command::Online { registry, output, per_stratum, seed, parallel, report } => run_online(
            &mut cfg,
            registry,
            output,
            *per_stratum,
            *seed,
            *parallel,
            report.as_deref(),
        ),
    }
}
