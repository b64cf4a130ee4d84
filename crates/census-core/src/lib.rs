//! Stratified sampling and density extrapolation for counting small objects
//! (swimming pools) across a metropolitan region from aerial tiles.
//!
//! Pipeline: [`grid::create_grid`] → [`strata::classify_grid`] →
//! [`sampling`] (batch or online) → external acquisition and detection →
//! [`estimate::estimate`].

pub mod config;
pub mod coords;
pub mod error;
pub mod estimate;
pub mod grid;
pub mod records;
pub mod sampling;
pub mod strata;
pub mod tables;

pub use config::{CensusConfig, ConfigWarning};
pub use coords::{haversine_m, Bounds, DegreeScale, LatLon};
pub use error::{CensusError, Result};
pub use estimate::{estimate, Estimate, EstimationRow};
pub use grid::{create_grid, GridCell};
pub use records::{DetectionRecord, MetadataRecord, Sample, SampleOrigin};
pub use strata::{classify_grid, LongitudeBands, Stratum, StratumRule};
