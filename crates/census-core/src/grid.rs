//! Fixed-size tiling of a bounding box.
//!
//! Cells are emitted row-major: latitude bands outer (south → north),
//! longitude bands inner (west → east). A trailing band too narrow to hold a
//! full cell is dropped, so the result tiles the box without covering it.

use serde::{Deserialize, Serialize};

use crate::coords::{Bounds, DegreeScale, LatLon};
use crate::strata::Stratum;

/// Absorbs float error when a span is an exact multiple of the step.
const BAND_EPSILON: f64 = 1e-9;

/// One tile of the sampling grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridCell {
    /// Row-major index; unique and stable for a given (bounds, cell size).
    pub id: u64,
    pub bounds: Bounds,
    pub center: LatLon,
    /// Nominal area (`cell_size_km²`), not corrected for latitude.
    pub area_km2: f64,
    /// `None` until the cell has been through a [`crate::strata::StratumRule`].
    pub stratum: Option<Stratum>,
}

impl GridCell {
    pub fn with_stratum(self, stratum: Stratum) -> Self {
        Self { stratum: Some(stratum), ..self }
    }
}

/// Number of whole `step`-wide bands that fit in `span`.
fn full_bands(span: f64, step: f64) -> u64 {
    if span <= 0.0 || step <= 0.0 {
        return 0;
    }
    (span / step + BAND_EPSILON).floor() as u64
}

/// Tile `bounds` into `cell_size_km` squares under the given degree scale.
///
/// Pure and deterministic: identical inputs always give identical cells and ids.
pub fn create_grid(bounds: Bounds, cell_size_km: f64, scale: DegreeScale) -> Vec<GridCell> {
    let lat_step = scale.lat_step(cell_size_km);
    let lon_step = scale.lon_step(cell_size_km);
    let n_rows = full_bands(bounds.lat_span(), lat_step);
    let n_cols = full_bands(bounds.lon_span(), lon_step);
    let area_km2 = cell_size_km * cell_size_km;

    let mut cells = Vec::with_capacity((n_rows * n_cols) as usize);
    for r in 0..n_rows {
        // Edges come from the index, not a running sum, so error does not accumulate.
        let min_lat = bounds.min_lat + r as f64 * lat_step;
        let max_lat = bounds.min_lat + (r + 1) as f64 * lat_step;
        for c in 0..n_cols {
            let min_lon = bounds.min_lon + c as f64 * lon_step;
            let max_lon = bounds.min_lon + (c + 1) as f64 * lon_step;
            let cell_bounds = Bounds::new(min_lat, max_lat, min_lon, max_lon);
            cells.push(GridCell {
                id: r * n_cols + c,
                bounds: cell_bounds,
                center: cell_bounds.center(),
                area_km2,
                stratum: None,
            });
        }
    }
    cells
}
