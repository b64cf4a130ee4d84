//! Stratum labels and the rules that assign them.
//!
//! Labels are configuration, not geography baked into the code: the default
//! rule splits the region into three longitude bands whose thresholds and
//! names come from [`crate::config::ClassifierConfig`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::ClassifierConfig;
use crate::coords::LatLon;
use crate::grid::GridCell;

/// Name of a socioeconomic stratum, e.g. `high_income`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Stratum(String);

impl Stratum {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Stratum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Stratum {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A deterministic point → stratum rule.
///
/// Implementations must be total over the target region and pure: the same
/// point always yields the same label for the lifetime of a run.
pub trait StratumRule {
    fn classify(&self, point: LatLon) -> Stratum;

    /// Every label this rule can produce.
    fn labels(&self) -> Vec<Stratum>;
}

/// Three longitude bands: west of `west_of`, east of `east_of`, and between.
///
/// Points exactly on a threshold fall in the middle band.
#[derive(Debug, Clone, PartialEq)]
pub struct LongitudeBands {
    west_of: f64,
    east_of: f64,
    west: Stratum,
    middle: Stratum,
    east: Stratum,
}

impl LongitudeBands {
    pub fn new(west_of: f64, east_of: f64, west: Stratum, middle: Stratum, east: Stratum) -> Self {
        Self { west_of, east_of, west, middle, east }
    }

    pub fn from_config(cfg: &ClassifierConfig) -> Self {
        Self::new(
            cfg.west_of,
            cfg.east_of,
            Stratum::new(cfg.west_label.clone()),
            Stratum::new(cfg.middle_label.clone()),
            Stratum::new(cfg.east_label.clone()),
        )
    }
}

impl StratumRule for LongitudeBands {
    fn classify(&self, point: LatLon) -> Stratum {
        if point.lon < self.west_of {
            self.west.clone()
        } else if point.lon > self.east_of {
            self.east.clone()
        } else {
            self.middle.clone()
        }
    }

    fn labels(&self) -> Vec<Stratum> {
        vec![self.west.clone(), self.middle.clone(), self.east.clone()]
    }
}

/// Label every cell by its center.
#[cfg(not(feature = "threading"))]
pub fn classify_grid<R: StratumRule>(cells: Vec<GridCell>, rule: &R) -> Vec<GridCell> {
    cells
        .into_iter()
        .map(|cell| {
            let stratum = rule.classify(cell.center);
            cell.with_stratum(stratum)
        })
        .collect()
}

/// Label every cell by its center.
#[cfg(feature = "threading")]
pub fn classify_grid<R: StratumRule + Sync>(cells: Vec<GridCell>, rule: &R) -> Vec<GridCell> {
    use rayon::prelude::*;
    cells
        .into_par_iter()
        .map(|cell| {
            let stratum = rule.classify(cell.center);
            cell.with_stratum(stratum)
        })
        .collect()
}
