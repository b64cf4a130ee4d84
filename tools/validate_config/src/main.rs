/// Config tool: checks a census config, prints what it resolves to, and can
/// write the built-in calibration as a starting file.
use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use census_core::config::CensusConfig;
use census_core::{classify_grid, create_grid};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "validate_config", about = "Validate a census config and summarise what it implies")]
struct Args {
    /// Config to check; the built-in calibration when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the fully resolved config as JSON
    #[arg(long)]
    print: bool,

    /// Write the built-in calibration to this path and exit
    #[arg(long)]
    write_default: Option<PathBuf>,

    /// Treat warnings as errors
    #[arg(long)]
    strict: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(path) = &args.write_default {
        let text = serde_json::to_string_pretty(&CensusConfig::default())?;
        fs::write(path, text + "\n").with_context(|| format!("Cannot write {}", path.display()))?;
        eprintln!("[validate_config] default config → {}", path.display());
        return Ok(());
    }

    let (cfg, source) = match &args.config {
        Some(p) => (
            CensusConfig::load(p).with_context(|| format!("Cannot load config {}", p.display()))?,
            p.display().to_string(),
        ),
        None => (CensusConfig::default(), "built-in".to_string()),
    };
    let warnings = cfg.validate().with_context(|| format!("{source}: configuration rejected"))?;

    let r = &cfg.region;
    let cells = classify_grid(create_grid(r.bounds, r.cell_size_km, r.scale), &cfg.rule());
    eprintln!("[validate_config] {source}: {} grid cells of {} km", cells.len(), r.cell_size_km);
    eprintln!(
        "  {:<16} {:>7} {:>7} {:>6} {:>6} {:>7} {:>7}",
        "stratum", "cells", "weight", "quota", "corr", "share", "anchors"
    );
    for s in &cfg.strata {
        let stratum = Some(s.stratum());
        let n = cells.iter().filter(|c| c.stratum == stratum).count();
        let quota = census_core::sampling::batch::quota(cfg.batch.total_samples, s.sample_weight);
        let flag = if quota > n { "  [short]" } else { "" };
        eprintln!(
            "  {:<16} {:>7} {:>7.3} {:>6} {:>6.2} {:>7.3} {:>7}{flag}",
            s.label,
            n,
            s.sample_weight,
            quota,
            s.correction_factor,
            s.area_share,
            s.anchors.len()
        );
    }

    for w in &warnings {
        eprintln!("  [warn] {w}");
    }
    if args.print {
        println!("{}", serde_json::to_string_pretty(&cfg)?);
    }
    if args.strict && !warnings.is_empty() {
        bail!("{} warning(s) in {source}", warnings.len());
    }
    eprintln!("[validate_config] OK");
    Ok(())
}
