//! Run configuration.
//!
//! One immutable [`CensusConfig`] is loaded per run and handed by reference to
//! every component. Defaults hold the São Paulo calibration; every field may be
//! overridden from a JSON file, and missing fields fall back to the default.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::coords::{Bounds, DegreeScale, LatLon};
use crate::error::{CensusError, Result};
use crate::strata::{LongitudeBands, Stratum, StratumRule};

/// Tolerance on weight and area-share sums.
pub(crate) const SUM_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CensusConfig {
    pub region: RegionConfig,
    pub classifier: ClassifierConfig,
    /// Per-stratum calibration. Order here is the order rows are reported in.
    pub strata: Vec<StratumConfig>,
    pub batch: BatchConfig,
    pub online: OnlineConfig,
    pub estimation: EstimationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionConfig {
    pub bounds: Bounds,
    pub cell_size_km: f64,
    pub scale: DegreeScale,
}

/// Thresholds and labels for [`LongitudeBands`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub west_of: f64,
    pub east_of: f64,
    pub west_label: String,
    pub middle_label: String,
    pub east_label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anchor {
    pub name: String,
    pub lat: f64,
    pub lon: f64,
}

impl Anchor {
    fn new(name: &str, lat: f64, lon: f64) -> Self {
        Self { name: name.to_string(), lat, lon }
    }

    pub fn position(&self) -> LatLon {
        LatLon::new(self.lat, self.lon)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StratumConfig {
    pub label: String,
    /// Fraction of the batch sample drawn from this stratum.
    pub sample_weight: f64,
    /// Multiplier applied to observed density.
    pub correction_factor: f64,
    /// Fraction of the target area attributed to this stratum.
    pub area_share: f64,
    /// Jitter centres for online sampling.
    #[serde(default)]
    pub anchors: Vec<Anchor>,
}

impl StratumConfig {
    pub fn stratum(&self) -> Stratum {
        Stratum::new(self.label.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub total_samples: usize,
    pub seed: u64,
}

/// How an online candidate gets its stratum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorLabelPolicy {
    /// Run the candidate through the classifier; off-stratum candidates are discarded.
    Classify,
    /// Use the label of the anchor list the candidate was jittered from.
    AnchorGroup,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OnlineConfig {
    pub samples_per_stratum: usize,
    /// Half-width of the square jitter box, in degrees.
    pub jitter_deg: f64,
    /// Minimum distance between registered locations; batch draws honour it too.
    pub min_separation_m: f64,
    /// Attempt budget per requested sample; total budget = requested × this.
    pub max_attempts_per_sample: u32,
    pub seed: u64,
    pub label_policy: AnchorLabelPolicy,
}

impl OnlineConfig {
    pub fn attempt_budget(&self, requested: usize) -> u64 {
        requested as u64 * u64::from(self.max_attempts_per_sample)
    }
}

/// What a failed acquisition (`success = false`) contributes to the estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailedAcquisitionPolicy {
    /// Neither area nor detections.
    Exclude,
    /// Observed area with zero detections.
    CountAsEmpty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimationConfig {
    /// Ground area covered by one acquired image.
    pub tile_area_km2: f64,
    pub total_target_area_km2: f64,
    /// Detector recall in (0, 1]; the raw total is divided by it.
    pub recall: f64,
    pub failed_acquisitions: FailedAcquisitionPolicy,
    /// Count only detections with this class label.
    pub class_label: Option<String>,
    /// Count only detections at or above this confidence.
    pub min_confidence: Option<f64>,
}

/// Findings that do not stop a run but should be looked at.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigWarning {
    AreaSharesDoNotSumToOne { sum: f64 },
    ClassifierLabelNotConfigured { label: String },
    StratumWithoutAnchors { label: String },
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AreaSharesDoNotSumToOne { sum } => {
                write!(f, "area shares sum to {sum:.6}, expected 1")
            }
            Self::ClassifierLabelNotConfigured { label } => {
                write!(f, "classifier emits `{label}` but no stratum with that label is configured")
            }
            Self::StratumWithoutAnchors { label } => {
                write!(f, "stratum `{label}` has no anchors; online sampling will skip it")
            }
        }
    }
}

impl CensusConfig {
    /// Read a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|source| CensusError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| CensusError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn stratum(&self, label: &str) -> Option<&StratumConfig> {
        self.strata.iter().find(|s| s.label == label)
    }

    pub fn rule(&self) -> LongitudeBands {
        LongitudeBands::from_config(&self.classifier)
    }

    pub fn area_share_sum(&self) -> f64 {
        self.strata.iter().map(|s| s.area_share).sum()
    }

    /// Check every constraint the components rely on.
    ///
    /// Hard violations are errors; soft ones come back as warnings.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>> {
        let invalid = |msg: String| Err(CensusError::InvalidConfig(msg));
        let r = &self.region;
        if r.bounds.min_lat >= r.bounds.max_lat || r.bounds.min_lon >= r.bounds.max_lon {
            return invalid(format!("region bounds are empty or inverted: {:?}", r.bounds));
        }
        if !(r.cell_size_km > 0.0) {
            return invalid(format!("cell_size_km must be > 0, got {}", r.cell_size_km));
        }
        if !(r.scale.km_per_deg_lat > 0.0 && r.scale.km_per_deg_lon > 0.0) {
            return invalid("km-per-degree scale must be positive".into());
        }
        if self.classifier.west_of > self.classifier.east_of {
            return invalid(format!(
                "classifier west_of ({}) is east of east_of ({})",
                self.classifier.west_of, self.classifier.east_of
            ));
        }
        if self.strata.is_empty() {
            return invalid("no strata configured".into());
        }

        let mut seen = HashSet::new();
        let mut weight_sum = 0.0;
        for s in &self.strata {
            if !seen.insert(s.label.as_str()) {
                return invalid(format!("duplicate stratum label `{}`", s.label));
            }
            if !(s.sample_weight >= 0.0) {
                return invalid(format!("stratum `{}`: sample_weight must be ≥ 0", s.label));
            }
            if !(s.correction_factor > 0.0) {
                return invalid(format!("stratum `{}`: correction_factor must be > 0", s.label));
            }
            if !(s.area_share > 0.0) {
                return invalid(format!("stratum `{}`: area_share must be > 0", s.label));
            }
            weight_sum += s.sample_weight;
        }
        if weight_sum > 1.0 + SUM_TOLERANCE {
            return invalid(format!("sample weights sum to {weight_sum:.6}, must be ≤ 1"));
        }

        let o = &self.online;
        if !(o.jitter_deg > 0.0) {
            return invalid(format!("online jitter_deg must be > 0, got {}", o.jitter_deg));
        }
        if !(o.min_separation_m > 0.0) {
            return invalid(format!("online min_separation_m must be > 0, got {}", o.min_separation_m));
        }
        if o.max_attempts_per_sample == 0 {
            return invalid("online max_attempts_per_sample must be ≥ 1".into());
        }

        let e = &self.estimation;
        if !(e.recall > 0.0 && e.recall <= 1.0) {
            return invalid(format!("recall must lie in (0, 1], got {}", e.recall));
        }
        if !(e.tile_area_km2 > 0.0) {
            return invalid(format!("tile_area_km2 must be > 0, got {}", e.tile_area_km2));
        }
        if !(e.total_target_area_km2 > 0.0) {
            return invalid(format!(
                "total_target_area_km2 must be > 0, got {}",
                e.total_target_area_km2
            ));
        }
        if let Some(c) = e.min_confidence {
            if !(0.0..=1.0).contains(&c) {
                return invalid(format!("min_confidence must lie in [0, 1], got {c}"));
            }
        }

        let mut warnings = Vec::new();
        let sum = self.area_share_sum();
        if (sum - 1.0).abs() > SUM_TOLERANCE {
            warnings.push(ConfigWarning::AreaSharesDoNotSumToOne { sum });
        }
        for label in self.rule().labels() {
            if self.stratum(label.as_str()).is_none() {
                warnings.push(ConfigWarning::ClassifierLabelNotConfigured {
                    label: label.to_string(),
                });
            }
        }
        for s in self.strata.iter().filter(|s| s.anchors.is_empty()) {
            warnings.push(ConfigWarning::StratumWithoutAnchors { label: s.label.clone() });
        }
        Ok(warnings)
    }
}

// ── Defaults (São Paulo calibration) ─────────────────────────────────────────

impl Default for CensusConfig {
    fn default() -> Self {
        Self {
            region: RegionConfig::default(),
            classifier: ClassifierConfig::default(),
            strata: default_strata(),
            batch: BatchConfig::default(),
            online: OnlineConfig::default(),
            estimation: EstimationConfig::default(),
        }
    }
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            bounds: Bounds::new(-23.8, -23.4, -46.85, -46.35),
            cell_size_km: 0.5,
            scale: DegreeScale::default(),
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            west_of: -46.65,
            east_of: -46.55,
            west_label: "high_income".into(),
            middle_label: "middle_income".into(),
            east_label: "low_income".into(),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { total_samples: 600, seed: 42 }
    }
}

impl Default for OnlineConfig {
    fn default() -> Self {
        Self {
            samples_per_stratum: 300,
            jitter_deg: 0.02,
            min_separation_m: 150.0,
            max_attempts_per_sample: 50,
            seed: 42,
            label_policy: AnchorLabelPolicy::Classify,
        }
    }
}

impl Default for EstimationConfig {
    fn default() -> Self {
        Self {
            tile_area_km2: 0.0583,
            total_target_area_km2: 1521.0,
            recall: 0.15,
            failed_acquisitions: FailedAcquisitionPolicy::Exclude,
            class_label: None,
            min_confidence: None,
        }
    }
}

fn default_strata() -> Vec<StratumConfig> {
    vec![
        StratumConfig {
            label: "high_income".into(),
            sample_weight: 0.3,
            correction_factor: 2.0,
            area_share: 0.25,
            anchors: vec![
                Anchor::new("Jardins", -23.587, -46.676),
                Anchor::new("Morumbi", -23.601, -46.722),
                Anchor::new("Vila Olímpia", -23.604, -46.658),
                Anchor::new("Brooklin", -23.625, -46.698),
                Anchor::new("Pinheiros", -23.556, -46.665),
                Anchor::new("Alto de Pinheiros", -23.571, -46.680),
            ],
        },
        StratumConfig {
            label: "middle_income".into(),
            sample_weight: 0.4,
            correction_factor: 1.3,
            area_share: 0.50,
            anchors: vec![
                Anchor::new("Vila Mariana", -23.543, -46.616),
                Anchor::new("Mooca", -23.521, -46.595),
                Anchor::new("Pompeia", -23.512, -46.634),
                Anchor::new("Lapa", -23.497, -46.675),
                Anchor::new("Água Branca", -23.533, -46.655),
            ],
        },
        StratumConfig {
            label: "low_income".into(),
            sample_weight: 0.3,
            correction_factor: 0.8,
            area_share: 0.25,
            anchors: vec![
                Anchor::new("Capão Redondo", -23.681, -46.602),
                Anchor::new("Jardim Ângela", -23.688, -46.713),
                Anchor::new("Grajaú", -23.698, -46.726),
                Anchor::new("Cidade Ademar", -23.705, -46.608),
                Anchor::new("Itaquera", -23.651, -46.539),
            ],
        },
    ]
}
