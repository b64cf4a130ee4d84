/// Estimation tool: joins detector output to the acquisition registry and
/// extrapolates per-stratum pool densities to a region-wide count.
///
/// Writes `estimate.csv` (one row per stratum), `estimate.json` (rows, totals,
/// join summary) and `estimate.txt` (the summary table, also printed) to the
/// output directory.
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use census_core::config::{CensusConfig, FailedAcquisitionPolicy};
use census_core::estimate::render_summary;
use census_core::{estimate, tables};
use clap::{Parser, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "estimator", about = "Estimate the regional pool count from per-tile detections")]
struct Args {
    /// JSON config; built-in São Paulo calibration when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Registry CSV written by the acquisition service
    #[arg(short, long, default_value = "dataset/metadata.csv")]
    metadata: PathBuf,

    /// Detection CSV written by the detector
    #[arg(short, long, default_value = "dataset/detections.csv")]
    detections: PathBuf,

    /// Output directory for estimate.csv / .json / .txt
    #[arg(short, long, default_value = "results")]
    output: PathBuf,

    /// Also write every matched detection with its tile coordinates
    #[arg(long)]
    points: Option<PathBuf>,

    /// Override the configured detector recall
    #[arg(long)]
    recall: Option<f64>,

    /// Count only detections at or above this confidence
    #[arg(long)]
    min_confidence: Option<f64>,

    /// Count only detections with this class label
    #[arg(long)]
    class: Option<String>,

    /// What failed acquisitions contribute
    #[arg(long, value_enum)]
    failed: Option<FailedArg>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum FailedArg {
    Exclude,
    CountAsEmpty,
}

impl From<FailedArg> for FailedAcquisitionPolicy {
    fn from(a: FailedArg) -> Self {
        match a {
            FailedArg::Exclude => Self::Exclude,
            FailedArg::CountAsEmpty => Self::CountAsEmpty,
        }
    }
}

// ── Main ─────────────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let mut cfg = match &args.config {
        Some(p) => CensusConfig::load(p).with_context(|| format!("Cannot load config {}", p.display()))?,
        None => CensusConfig::default(),
    };
    let e = &mut cfg.estimation;
    if let Some(r) = args.recall {
        e.recall = r;
    }
    if let Some(c) = args.min_confidence {
        e.min_confidence = Some(c);
    }
    if let Some(label) = &args.class {
        e.class_label = Some(label.clone());
    }
    if let Some(f) = args.failed {
        e.failed_acquisitions = f.into();
    }
    for w in cfg.validate().context("Configuration rejected")? {
        warn!("config: {w}");
    }

    let metadata = tables::read_registry(&args.metadata)
        .with_context(|| format!("Cannot read registry {}", args.metadata.display()))?;
    let detections = tables::read_detections(&args.detections)
        .with_context(|| format!("Cannot read detections {}", args.detections.display()))?;
    info!(registry_rows = metadata.len(), detections = detections.len(), "inputs loaded");

    let est = estimate(&detections, &metadata, &cfg).context("Estimation failed")?;

    fs::create_dir_all(&args.output)
        .with_context(|| format!("Cannot create {}", args.output.display()))?;
    let csv_path = args.output.join("estimate.csv");
    let json_path = args.output.join("estimate.json");
    let text_path = args.output.join("estimate.txt");
    tables::write_estimate_rows(&csv_path, &est.rows)
        .with_context(|| format!("Cannot write {}", csv_path.display()))?;
    tables::write_json(&json_path, &est)
        .with_context(|| format!("Cannot write {}", json_path.display()))?;
    tables::write_summary(&text_path, &est)
        .with_context(|| format!("Cannot write {}", text_path.display()))?;
    if let Some(points) = &args.points {
        tables::write_matched_points(points, &est.matched)
            .with_context(|| format!("Cannot write {}", points.display()))?;
        eprintln!("[estimator] {} matched points → {}", est.matched.len(), points.display());
    }

    if !est.join.unmatched_images.is_empty() {
        eprintln!(
            "[estimator] [warn] {} detections on {} images had no registry row:",
            est.join.unmatched,
            est.join.unmatched_images.len()
        );
        for img in est.join.unmatched_images.iter().take(10) {
            eprintln!("    {img}");
        }
        if est.join.unmatched_images.len() > 10 {
            eprintln!("    … and {} more", est.join.unmatched_images.len() - 10);
        }
    }

    print!("{}", render_summary(&est));
    eprintln!(
        "[estimator] wrote {}, {} and {}",
        csv_path.display(),
        json_path.display(),
        text_path.display()
    );
    Ok(())
}
