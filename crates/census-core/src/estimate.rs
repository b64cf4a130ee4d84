//! Population estimate from per-tile detections.
//!
//! Detections are joined to registry records through the numeric location id
//! embedded in image file names. Per stratum:
//!
//! ```text
//! observed_area    = tiles × tile_area_km2
//! density          = detections / observed_area        (0 when area is 0)
//! corrected        = density × correction_factor
//! target_area      = area_share × total_target_area_km2
//! pools_estimated  = corrected × target_area
//! ```
//!
//! The raw total sums `pools_estimated`; the adjusted total divides it by the
//! detector recall. Values keep full precision; only [`render_summary`] rounds.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt::Write as _;

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::{CensusConfig, FailedAcquisitionPolicy, SUM_TOLERANCE};
use crate::error::{CensusError, Result};
use crate::records::{DetectionRecord, MetadataRecord};
use crate::strata::Stratum;

pub const RECALL_NOTE: &str = "adjusted total = raw total / recall; a blunt post-hoc scaling \
by a fixed detector recall, not a calibrated estimator";

/// One stratum's line of the estimate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EstimationRow {
    pub stratum: Stratum,
    pub observed_area_km2: f64,
    /// Bounding boxes matched to tiles of this stratum.
    pub observed_count: u64,
    /// Tiles contributing area.
    pub tiles_observed: u64,
    /// Tiles with at least one matched box. Reported only; never used in density.
    pub positive_tiles: u64,
    pub density: f64,
    pub correction_factor: f64,
    pub area_share: f64,
    pub target_area_km2: f64,
    pub corrected_density: f64,
    pub pools_estimated: f64,
}

/// A detection with the coordinates of its tile.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchedDetection {
    pub location_id: u64,
    pub image: String,
    pub class_label: String,
    pub confidence: f64,
    pub lat: f64,
    pub lon: f64,
    pub stratum: Stratum,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JoinSummary {
    pub detections: usize,
    /// Dropped by the class-label or confidence filter.
    pub filtered: usize,
    pub matched: usize,
    pub unmatched: usize,
    /// Distinct image references that matched no contributing tile.
    pub unmatched_images: Vec<String>,
    /// Registry rows whose key was already taken by an earlier row.
    pub duplicate_keys: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Estimate {
    pub rows: Vec<EstimationRow>,
    pub total_raw: f64,
    pub total_adjusted: f64,
    pub recall: f64,
    pub recall_note: &'static str,
    /// Σ area_share over configured strata; 1 unless the calibration is off.
    pub area_share_sum: f64,
    pub join: JoinSummary,
    #[serde(skip)]
    pub matched: Vec<MatchedDetection>,
}

/// Numeric location id embedded in a file name or path.
///
/// Backslashes are treated as separators and directories are stripped before
/// the first run of digits in the file name is parsed: `raw\cell_42.jpg` → 42.
pub fn location_key(reference: &str) -> Option<u64> {
    let normalized = reference.replace('\\', "/");
    let name = normalized.rsplit('/').next().unwrap_or("").trim();
    let start = name.find(|c: char| c.is_ascii_digit())?;
    let digits: &str = &name[start..];
    let end = digits.find(|c: char| !c.is_ascii_digit()).unwrap_or(digits.len());
    digits[..end].parse().ok()
}

/// Join key of a registry record: the id in its file name, else its location id.
pub fn metadata_key(record: &MetadataRecord) -> u64 {
    record
        .artifact_path
        .as_deref()
        .and_then(location_key)
        .unwrap_or(record.location_id)
}

fn passes_filters(d: &DetectionRecord, config: &CensusConfig) -> bool {
    let e = &config.estimation;
    if let Some(label) = &e.class_label {
        if &d.class_label != label {
            return false;
        }
    }
    if let Some(min) = e.min_confidence {
        if d.confidence < min {
            return false;
        }
    }
    true
}

/// Join `detections` to `metadata` and extrapolate per stratum.
///
/// Fails on a registry stratum the config does not define or on a recall
/// outside (0, 1]. Detections that cannot be joined are counted in
/// [`JoinSummary`] and left out.
pub fn estimate(
    detections: &[DetectionRecord],
    metadata: &[MetadataRecord],
    config: &CensusConfig,
) -> Result<Estimate> {
    let e = &config.estimation;
    if !(e.recall > 0.0 && e.recall <= 1.0) {
        return Err(CensusError::InvalidConfig(format!(
            "recall must lie in (0, 1], got {}",
            e.recall
        )));
    }

    for record in metadata {
        if config.stratum(record.stratum.as_str()).is_none() {
            return Err(CensusError::UnknownStratum {
                stratum: record.stratum.to_string(),
                origin: format!("registry row for location {}", record.location_id),
            });
        }
    }

    // Key → acquired record; first row wins. Failed rows have no image to
    // join, so they never claim a key.
    let mut by_key: HashMap<u64, &MetadataRecord> = HashMap::new();
    let mut tiles: HashMap<&Stratum, u64> = HashMap::new();
    let mut join = JoinSummary { detections: detections.len(), ..JoinSummary::default() };
    for record in metadata {
        if !record.success {
            if e.failed_acquisitions == FailedAcquisitionPolicy::CountAsEmpty {
                *tiles.entry(&record.stratum).or_default() += 1;
            }
            continue;
        }
        let key = metadata_key(record);
        if by_key.contains_key(&key) {
            join.duplicate_keys += 1;
            warn!(key, location_id = record.location_id, "duplicate registry key, keeping first row");
            continue;
        }
        by_key.insert(key, record);
        *tiles.entry(&record.stratum).or_default() += 1;
    }

    let mut counts: HashMap<&Stratum, u64> = HashMap::new();
    let mut positive: HashSet<u64> = HashSet::new();
    let mut unmatched_images = BTreeSet::new();
    let mut matched = Vec::new();
    for d in detections {
        if !passes_filters(d, config) {
            join.filtered += 1;
            continue;
        }
        let hit = location_key(&d.image_reference).and_then(|k| by_key.get(&k).map(|r| (k, *r)));
        let Some((key, record)) = hit else {
            join.unmatched += 1;
            unmatched_images.insert(d.image_reference.clone());
            continue;
        };
        join.matched += 1;
        *counts.entry(&record.stratum).or_default() += 1;
        positive.insert(key);
        matched.push(MatchedDetection {
            location_id: record.location_id,
            image: d.image_reference.clone(),
            class_label: d.class_label.clone(),
            confidence: d.confidence,
            lat: record.lat,
            lon: record.lon,
            stratum: record.stratum.clone(),
        });
    }
    join.unmatched_images = unmatched_images.into_iter().collect();
    if join.unmatched > 0 {
        warn!(
            unmatched = join.unmatched,
            images = join.unmatched_images.len(),
            "detections without a matching registry row were left out"
        );
    }

    let mut positive_by_stratum: HashMap<&Stratum, u64> = HashMap::new();
    for key in &positive {
        if let Some(record) = by_key.get(key) {
            *positive_by_stratum.entry(&record.stratum).or_default() += 1;
        }
    }

    let rows: Vec<EstimationRow> = config
        .strata
        .iter()
        .map(|s| {
            let stratum = s.stratum();
            let tiles_observed = tiles.get(&stratum).copied().unwrap_or(0);
            let observed_count = counts.get(&stratum).copied().unwrap_or(0);
            let observed_area_km2 = tiles_observed as f64 * e.tile_area_km2;
            let density = if observed_area_km2 > 0.0 {
                observed_count as f64 / observed_area_km2
            } else {
                0.0
            };
            let corrected_density = density * s.correction_factor;
            let target_area_km2 = s.area_share * e.total_target_area_km2;
            EstimationRow {
                positive_tiles: positive_by_stratum.get(&stratum).copied().unwrap_or(0),
                stratum,
                observed_area_km2,
                observed_count,
                tiles_observed,
                density,
                correction_factor: s.correction_factor,
                area_share: s.area_share,
                target_area_km2,
                corrected_density,
                pools_estimated: corrected_density * target_area_km2,
            }
        })
        .collect();

    let area_share_sum = config.area_share_sum();
    if (area_share_sum - 1.0).abs() > SUM_TOLERANCE {
        warn!(area_share_sum, "area shares do not sum to 1; totals extrapolate over a different area");
    }

    let total_raw: f64 = rows.iter().map(|r| r.pools_estimated).sum();
    let total_adjusted = total_raw / e.recall;
    debug!(total_raw, total_adjusted, "estimate complete");

    Ok(Estimate {
        rows,
        total_raw,
        total_adjusted,
        recall: e.recall,
        recall_note: RECALL_NOTE,
        area_share_sum,
        join,
        matched,
    })
}

/// Human-readable report. Rounds for display only.
pub fn render_summary(est: &Estimate) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<16} {:>8} {:>6} {:>9} {:>9} {:>6} {:>6} {:>9} {:>10} {:>12}",
        "Stratum", "Tiles", "Pools", "Area km²", "Density", "Corr", "Share", "Target", "CorrDens", "Estimated"
    );
    let _ = writeln!(out, "{}", "-".repeat(102));
    for r in &est.rows {
        let _ = writeln!(
            out,
            "{:<16} {:>8} {:>6} {:>9.3} {:>9.3} {:>6.2} {:>6.2} {:>9.2} {:>10.3} {:>12.0}",
            r.stratum.as_str(),
            r.tiles_observed,
            r.observed_count,
            r.observed_area_km2,
            r.density,
            r.correction_factor,
            r.area_share,
            r.target_area_km2,
            r.corrected_density,
            r.pools_estimated,
        );
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "Raw estimate:      {:>12.0}", est.total_raw);
    let _ = writeln!(
        out,
        "Adjusted estimate: {:>12.0}  (recall = {:.4})",
        est.total_adjusted, est.recall
    );
    let _ = writeln!(out, "Note: {}", est.recall_note);
    let _ = writeln!(
        out,
        "Detections: {} matched, {} unmatched, {} filtered",
        est.join.matched, est.join.unmatched, est.join.filtered
    );
    if (est.area_share_sum - 1.0).abs() > SUM_TOLERANCE {
        let _ = writeln!(out, "Warning: area shares sum to {:.4}", est.area_share_sum);
    }
    out
}
