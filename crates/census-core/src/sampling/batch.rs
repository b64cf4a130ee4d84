//! Stratified sampling of a classified grid.
//!
//! Quota per stratum is `floor(total × weight)`. Each stratum's cells are
//! visited in a seeded random order and accepted through the registry, so a
//! cell closer than the minimum separation to anything already registered
//! (earlier runs, online samples, or cells accepted moments ago) is skipped.
//! A stratum stops when its quota is met or its cells run out. The result is
//! a pure function of (grid, weights, seed, registry contents).

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::StratumConfig;
use crate::grid::GridCell;
use crate::records::{MetadataRecord, Sample, SampleOrigin};
use crate::sampling::registry::{IdAllocator, SampleRegistry};
use crate::strata::Stratum;

/// Absorbs float error in `total × weight` before flooring (e.g. 0.3 × 600).
const QUOTA_EPSILON: f64 = 1e-9;

/// How one stratum's quota was met.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StratumQuota {
    pub stratum: Stratum,
    /// `floor(total × weight)`.
    pub requested: usize,
    /// Cells in the grid carrying this stratum.
    pub available: usize,
    pub drawn: usize,
    /// Cells skipped for lying within the separation distance of a registered location.
    pub rejected_too_close: usize,
}

impl StratumQuota {
    pub fn shortfall(&self) -> usize {
        self.requested - self.drawn
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchSample {
    pub samples: Vec<Sample>,
    pub quotas: Vec<StratumQuota>,
}

impl BatchSample {
    pub fn count_in(&self, stratum: &Stratum) -> usize {
        self.samples.iter().filter(|s| &s.stratum == stratum).count()
    }

    pub fn is_partial(&self) -> bool {
        self.quotas.iter().any(|q| q.drawn < q.requested)
    }
}

pub fn quota(total_samples: usize, weight: f64) -> usize {
    (total_samples as f64 * weight + QUOTA_EPSILON).floor().max(0.0) as usize
}

/// Draw a stratified sample from `cells`, registering every accepted cell.
///
/// Unclassified cells are never drawn. A stratum with no cells yields no
/// samples rather than an error. Accepted samples get ids from `ids`, so they
/// never collide with locations already in `registry`; the grid cell id is
/// kept in [`SampleOrigin::GridCell`].
pub fn stratified_sample<R: SampleRegistry>(
    cells: &[GridCell],
    strata: &[StratumConfig],
    total_samples: usize,
    seed: u64,
    registry: &mut R,
    ids: &IdAllocator,
    min_separation_m: f64,
) -> BatchSample {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut samples = Vec::new();
    let mut quotas = Vec::with_capacity(strata.len());

    for cfg in strata {
        let stratum = cfg.stratum();
        let mut pool: Vec<&GridCell> = cells
            .iter()
            .filter(|c| c.stratum.as_ref() == Some(&stratum))
            .collect();
        let available = pool.len();
        let requested = quota(total_samples, cfg.sample_weight);
        pool.shuffle(&mut rng);

        let mut picked = Vec::with_capacity(requested.min(available));
        let mut rejected_too_close = 0;
        for cell in pool {
            if picked.len() == requested {
                break;
            }
            if registry.contains_within(cell.center, min_separation_m) {
                rejected_too_close += 1;
                continue;
            }
            let sample = Sample {
                id: ids.allocate(),
                position: cell.center,
                stratum: stratum.clone(),
                origin: SampleOrigin::GridCell { cell_id: cell.id },
            };
            if !registry.try_accept(MetadataRecord::pending(&sample), min_separation_m) {
                rejected_too_close += 1;
                continue;
            }
            picked.push(sample);
        }
        let drawn = picked.len();

        if drawn < requested {
            warn!(
                stratum = %stratum,
                requested,
                available,
                drawn,
                rejected_too_close,
                "stratum could not fill its quota"
            );
        }
        debug!(stratum = %stratum, drawn, rejected_too_close, "batch quota filled");

        samples.extend(picked);
        quotas.push(StratumQuota { stratum, requested, available, drawn, rejected_too_close });
    }

    BatchSample { samples, quotas }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CensusConfig;
    use crate::coords::{haversine_m, Bounds, DegreeScale, LatLon};
    use crate::grid::create_grid;
    use crate::sampling::registry::Registry;
    use crate::strata::classify_grid;
    use std::collections::HashSet;

    const MIN_SEP: f64 = 150.0;

    fn classified(cell_size_km: f64) -> (CensusConfig, Vec<GridCell>) {
        let cfg = CensusConfig::default();
        let grid = create_grid(cfg.region.bounds, cell_size_km, cfg.region.scale);
        let cells = classify_grid(grid, &cfg.rule());
        (cfg, cells)
    }

    /// Batch draw against a fresh registry.
    fn draw(cells: &[GridCell], cfg: &CensusConfig, total: usize, seed: u64) -> BatchSample {
        let mut registry = Registry::new();
        let ids = IdAllocator::after(&registry);
        stratified_sample(cells, &cfg.strata, total, seed, &mut registry, &ids, MIN_SEP)
    }

    fn cell_of(s: &Sample) -> u64 {
        match s.origin {
            SampleOrigin::GridCell { cell_id } => cell_id,
            ref other => panic!("batch sample with origin {other:?}"),
        }
    }

    #[test]
    fn floor_quota_law() {
        assert_eq!(quota(600, 0.3), 180);
        assert_eq!(quota(600, 0.4), 240);
        assert_eq!(quota(100, 0.333), 33);
        assert_eq!(quota(10, 0.0), 0);
    }

    #[test]
    fn quotas_180_240_180_on_full_grid() {
        let (cfg, cells) = classified(0.5);
        let result = draw(&cells, &cfg, 600, 42);
        let counts: Vec<usize> = cfg.strata.iter().map(|s| result.count_in(&s.stratum())).collect();
        assert_eq!(counts, vec![180, 240, 180]);
        for q in &result.quotas {
            assert!(q.available >= q.requested, "{q:?}");
            assert_eq!(q.drawn, q.requested);
            // 500 m cells never come within 150 m of each other.
            assert_eq!(q.rejected_too_close, 0);
        }
        assert!(!result.is_partial());
    }

    #[test]
    fn samples_are_distinct_cells_of_their_stratum() {
        let (cfg, cells) = classified(0.5);
        let result = draw(&cells, &cfg, 600, 7);
        let cell_ids: HashSet<u64> = result.samples.iter().map(cell_of).collect();
        let ids: HashSet<u64> = result.samples.iter().map(|s| s.id).collect();
        assert_eq!(cell_ids.len(), result.samples.len());
        assert_eq!(ids.len(), result.samples.len());
        for s in &result.samples {
            let cell = &cells[cell_of(s) as usize];
            assert_eq!(cell.stratum.as_ref(), Some(&s.stratum));
            assert_eq!(cell.center, s.position);
        }
    }

    #[test]
    fn accepted_cells_are_registered() {
        let (cfg, cells) = classified(0.5);
        let mut registry = Registry::new();
        let ids = IdAllocator::after(&registry);
        let result = stratified_sample(&cells, &cfg.strata, 60, 3, &mut registry, &ids, MIN_SEP);
        assert_eq!(registry.len(), result.samples.len());
        for (s, r) in result.samples.iter().zip(registry.records()) {
            assert_eq!(r.location_id, s.id);
            assert_eq!(r.position(), s.position);
        }
    }

    #[test]
    fn deterministic_given_seed() {
        let (cfg, cells) = classified(0.5);
        let a = draw(&cells, &cfg, 600, 42);
        let b = draw(&cells, &cfg, 600, 42);
        let c = draw(&cells, &cfg, 600, 43);
        assert_eq!(a, b);
        assert_ne!(a.samples, c.samples);
    }

    #[test]
    fn quota_capped_by_available_cells() {
        // 2 km cells leave far fewer than 240 middle-income cells.
        let (cfg, cells) = classified(2.0);
        let result = draw(&cells, &cfg, 10_000, 1);
        for q in &result.quotas {
            assert_eq!(q.drawn, q.available.min(q.requested));
            assert_eq!(q.shortfall(), q.requested - q.drawn);
        }
        assert!(result.is_partial());
        assert_eq!(
            result.samples.len(),
            result.quotas.iter().map(|q| q.drawn).sum::<usize>()
        );
    }

    /// 100 m cells are packed tighter than the separation distance; accepted
    /// samples must still be pairwise separated.
    #[test]
    fn separation_holds_for_cells_smaller_than_min_distance() {
        let (cfg, cells) = classified(0.1);
        let result = draw(&cells, &cfg, 600, 42);
        assert_eq!(result.samples.len(), 600);
        assert!(result.quotas.iter().any(|q| q.rejected_too_close > 0));
        let s = &result.samples;
        for i in 0..s.len() {
            for j in (i + 1)..s.len() {
                let d = haversine_m(s[i].position, s[j].position);
                assert!(d > MIN_SEP, "samples {} and {} are {d:.1} m apart", s[i].id, s[j].id);
            }
        }
    }

    /// Locations from an earlier run block nearby cells, and new ids continue
    /// after the largest registered id.
    #[test]
    fn respects_preloaded_registry() {
        let (cfg, cells) = classified(0.5);
        let prior: Vec<MetadataRecord> = cells
            .iter()
            .step_by(7)
            .enumerate()
            .map(|(i, c)| MetadataRecord {
                location_id: i as u64 + 1,
                // Offset 100 m north of the cell center.
                lat: c.center.lat + 100.0 / crate::coords::METRES_PER_DEG_LAT,
                lon: c.center.lon,
                stratum: c.stratum.clone().unwrap_or_else(|| Stratum::new("high_income")),
                artifact_path: Some(format!("cell_{}.jpg", i + 1)),
                success: true,
            })
            .collect();
        let max_prior = prior.len() as u64;

        let mut registry = Registry::from_records(prior.clone());
        let ids = IdAllocator::after(&registry);
        let result = stratified_sample(&cells, &cfg.strata, 600, 42, &mut registry, &ids, MIN_SEP);

        assert!(result.quotas.iter().any(|q| q.rejected_too_close > 0));
        for s in &result.samples {
            assert!(s.id > max_prior, "id {} collides with the registry", s.id);
            for p in &prior {
                let d = haversine_m(s.position, LatLon::new(p.lat, p.lon));
                assert!(d > MIN_SEP, "sample {} is {d:.1} m from location {}", s.id, p.location_id);
            }
        }
    }

    #[test]
    fn empty_stratum_yields_zero_samples() {
        let cfg = CensusConfig::default();
        // Entirely west of the high-income threshold.
        let bounds = Bounds::new(-23.8, -23.4, -46.85, -46.70);
        let cells = classify_grid(create_grid(bounds, 1.0, DegreeScale::default()), &cfg.rule());
        let result = draw(&cells, &cfg, 600, 42);
        assert_eq!(result.count_in(&Stratum::new("middle_income")), 0);
        assert_eq!(result.count_in(&Stratum::new("low_income")), 0);
        assert!(result.count_in(&Stratum::new("high_income")) > 0);
    }

    #[test]
    fn unclassified_cells_never_drawn() {
        let cfg = CensusConfig::default();
        let cells = create_grid(cfg.region.bounds, 1.0, cfg.region.scale);
        let result = draw(&cells, &cfg, 600, 42);
        assert!(result.samples.is_empty());
    }
}
