//! Incremental sampling by jittering around named anchors.
//!
//! Each attempt picks a random anchor of the stratum, offsets it by a uniform
//! draw from a square of half-width `jitter_deg`, and keeps the candidate only
//! if no registry entry lies within `min_separation_m`. Accepted candidates go
//! straight into the registry, so the next attempt already sees them.
//!
//! Attempts per stratum are capped at `requested × max_attempts_per_sample`;
//! running out is reported in [`StratumFill`], never silently dropped.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{AnchorLabelPolicy, OnlineConfig, StratumConfig};
use crate::coords::LatLon;
use crate::records::{MetadataRecord, Sample, SampleOrigin};
use crate::sampling::registry::{IdAllocator, SampleRegistry};
use crate::strata::{Stratum, StratumRule};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FillStatus {
    Complete,
    /// Attempt budget ran out before the request was met.
    BudgetExhausted,
    /// The stratum has no anchors to jitter around.
    NoAnchors,
}

/// Per-stratum account of one online run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StratumFill {
    pub stratum: Stratum,
    pub requested: usize,
    pub accepted: usize,
    pub attempts: u64,
    /// Candidates within the separation distance of an existing location.
    pub rejected_too_close: u64,
    /// Candidates the classifier put in another stratum.
    pub rejected_off_stratum: u64,
    pub status: FillStatus,
}

impl StratumFill {
    pub fn shortfall(&self) -> usize {
        self.requested - self.accepted
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OnlineOutcome {
    pub samples: Vec<Sample>,
    pub fills: Vec<StratumFill>,
}

impl OnlineOutcome {
    /// True when at least one stratum got fewer samples than requested.
    pub fn is_partial(&self) -> bool {
        self.fills.iter().any(|f| f.status != FillStatus::Complete)
    }

    pub fn shortfall(&self) -> usize {
        self.fills.iter().map(StratumFill::shortfall).sum()
    }
}

/// Each stratum draws from its own stream so results do not depend on the
/// order strata are processed in.
fn stratum_rng(seed: u64, index: usize) -> StdRng {
    StdRng::seed_from_u64(seed ^ (index as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

/// Generate up to `cfg.samples_per_stratum` new locations for every stratum.
///
/// `registry` should already hold every previously accepted location,
/// including those of earlier runs.
pub fn sample_online<R, S>(
    registry: &mut R,
    ids: &IdAllocator,
    strata: &[StratumConfig],
    rule: &S,
    cfg: &OnlineConfig,
) -> OnlineOutcome
where
    R: SampleRegistry,
    S: StratumRule,
{
    let mut samples = Vec::new();
    let mut fills = Vec::with_capacity(strata.len());
    for (i, stratum_cfg) in strata.iter().enumerate() {
        let mut rng = stratum_rng(cfg.seed, i);
        let (mut s, fill) = fill_stratum(registry, ids, stratum_cfg, rule, cfg, &mut rng);
        samples.append(&mut s);
        fills.push(fill);
    }
    finish(samples, fills)
}

/// Like [`sample_online`], but strata run concurrently against one
/// [`SharedRegistry`](crate::sampling::registry::SharedRegistry).
///
/// Every acceptance is a single locked check-and-append, so the separation
/// invariant holds across workers. Which of two competing candidates wins
/// depends on scheduling, so output is not reproducible run to run.
#[cfg(feature = "threading")]
pub fn sample_online_parallel<S>(
    registry: &crate::sampling::registry::SharedRegistry,
    ids: &IdAllocator,
    strata: &[StratumConfig],
    rule: &S,
    cfg: &OnlineConfig,
) -> OnlineOutcome
where
    S: StratumRule + Sync,
{
    use rayon::prelude::*;

    let parts: Vec<(Vec<Sample>, StratumFill)> = strata
        .par_iter()
        .enumerate()
        .map(|(i, stratum_cfg)| {
            let mut handle = registry;
            let mut rng = stratum_rng(cfg.seed, i);
            fill_stratum(&mut handle, ids, stratum_cfg, rule, cfg, &mut rng)
        })
        .collect();

    let mut samples = Vec::new();
    let mut fills = Vec::with_capacity(parts.len());
    for (mut s, fill) in parts {
        samples.append(&mut s);
        fills.push(fill);
    }
    finish(samples, fills)
}

fn finish(samples: Vec<Sample>, fills: Vec<StratumFill>) -> OnlineOutcome {
    let outcome = OnlineOutcome { samples, fills };
    if outcome.is_partial() {
        warn!(
            shortfall = outcome.shortfall(),
            "online sampling fulfilled only part of the request"
        );
    }
    outcome
}

fn fill_stratum<R, S>(
    registry: &mut R,
    ids: &IdAllocator,
    stratum_cfg: &StratumConfig,
    rule: &S,
    cfg: &OnlineConfig,
    rng: &mut StdRng,
) -> (Vec<Sample>, StratumFill)
where
    R: SampleRegistry,
    S: StratumRule,
{
    let target = stratum_cfg.stratum();
    let requested = cfg.samples_per_stratum;
    let mut fill = StratumFill {
        stratum: target.clone(),
        requested,
        accepted: 0,
        attempts: 0,
        rejected_too_close: 0,
        rejected_off_stratum: 0,
        status: FillStatus::Complete,
    };
    let mut samples = Vec::with_capacity(requested);

    if requested == 0 {
        return (samples, fill);
    }
    if stratum_cfg.anchors.is_empty() {
        warn!(stratum = %target, "no anchors configured, skipping");
        fill.status = FillStatus::NoAnchors;
        return (samples, fill);
    }

    let budget = cfg.attempt_budget(requested);
    let j = cfg.jitter_deg;
    while samples.len() < requested && fill.attempts < budget {
        fill.attempts += 1;
        let Some(anchor) = stratum_cfg.anchors.choose(rng) else {
            break;
        };
        let candidate = LatLon::new(
            anchor.lat + rng.gen_range(-j..=j),
            anchor.lon + rng.gen_range(-j..=j),
        );

        let stratum = match cfg.label_policy {
            AnchorLabelPolicy::AnchorGroup => target.clone(),
            AnchorLabelPolicy::Classify => {
                let s = rule.classify(candidate);
                if s != target {
                    fill.rejected_off_stratum += 1;
                    continue;
                }
                s
            }
        };

        // Cheap pre-check so rejected candidates don't consume ids.
        if registry.contains_within(candidate, cfg.min_separation_m) {
            fill.rejected_too_close += 1;
            continue;
        }
        let sample = Sample {
            id: ids.allocate(),
            position: candidate,
            stratum,
            origin: SampleOrigin::Jittered { anchor: anchor.name.clone() },
        };
        // The authoritative check; another worker may have claimed the spot.
        if !registry.try_accept(MetadataRecord::pending(&sample), cfg.min_separation_m) {
            fill.rejected_too_close += 1;
            continue;
        }
        samples.push(sample);
    }

    fill.accepted = samples.len();
    if fill.accepted < requested {
        fill.status = FillStatus::BudgetExhausted;
        warn!(
            stratum = %target,
            requested,
            accepted = fill.accepted,
            attempts = fill.attempts,
            "attempt budget exhausted"
        );
    } else {
        info!(stratum = %target, accepted = fill.accepted, attempts = fill.attempts, "stratum filled");
    }
    debug!(
        stratum = %target,
        too_close = fill.rejected_too_close,
        off_stratum = fill.rejected_off_stratum,
        "rejections"
    );
    (samples, fill)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Anchor, CensusConfig};
    use crate::coords::haversine_m;
    use crate::sampling::registry::Registry;
    use std::collections::HashSet;

    fn anchor_group_config(per_stratum: usize, seed: u64) -> CensusConfig {
        let mut cfg = CensusConfig::default();
        cfg.online.samples_per_stratum = per_stratum;
        cfg.online.seed = seed;
        cfg.online.label_policy = AnchorLabelPolicy::AnchorGroup;
        cfg
    }

    fn run(cfg: &CensusConfig, registry: &mut Registry) -> OnlineOutcome {
        let ids = IdAllocator::after(registry);
        sample_online(registry, &ids, &cfg.strata, &cfg.rule(), &cfg.online)
    }

    fn assert_separated(records: &[MetadataRecord], min_sep: f64) {
        for i in 0..records.len() {
            for j in (i + 1)..records.len() {
                let d = haversine_m(records[i].position(), records[j].position());
                assert!(d > min_sep, "records {i} and {j} only {d:.1} m apart");
            }
        }
    }

    #[test]
    fn fills_request_and_registers_every_sample() {
        let cfg = anchor_group_config(40, 1);
        let mut registry = Registry::new();
        let outcome = run(&cfg, &mut registry);
        assert!(!outcome.is_partial(), "{:?}", outcome.fills);
        assert_eq!(outcome.samples.len(), 120);
        assert_eq!(registry.len(), 120);
        for fill in &outcome.fills {
            assert_eq!(fill.accepted, 40);
            assert_eq!(fill.status, FillStatus::Complete);
        }
    }

    /// Pairwise separation holds over many seeds, including across a resumed run.
    #[test]
    fn separation_invariant_over_repeated_generation() {
        for seed in 0..12 {
            let mut cfg = anchor_group_config(60, seed);
            cfg.online.min_separation_m = 250.0;
            let mut registry = Registry::new();
            run(&cfg, &mut registry);
            cfg.online.seed = seed + 1000;
            run(&cfg, &mut registry);
            assert_separated(registry.records(), cfg.online.min_separation_m);
        }
    }

    #[test]
    fn respects_previously_persisted_locations() {
        let cfg = anchor_group_config(30, 5);
        let mut first = Registry::new();
        run(&cfg, &mut first);
        let prior: Vec<MetadataRecord> = first.into_records();
        let prior_ids: HashSet<u64> = prior.iter().map(|r| r.location_id).collect();
        let max_prior = prior_ids.iter().copied().max().unwrap();

        let mut resumed = Registry::from_records(prior.clone());
        let mut cfg2 = cfg.clone();
        cfg2.online.seed = 99;
        let outcome = run(&cfg2, &mut resumed);
        for s in &outcome.samples {
            assert!(s.id > max_prior, "id {} reused", s.id);
            for p in &prior {
                assert!(haversine_m(s.position, p.position()) > cfg.online.min_separation_m);
            }
        }
    }

    #[test]
    fn saturated_region_reports_partial_fulfilment() {
        let mut cfg = anchor_group_config(200, 3);
        // A 0.002° box holds only a handful of points 150 m apart.
        cfg.online.jitter_deg = 0.001;
        cfg.online.max_attempts_per_sample = 5;
        let mut registry = Registry::new();
        let outcome = run(&cfg, &mut registry);
        assert!(outcome.is_partial());
        for fill in &outcome.fills {
            assert_eq!(fill.status, FillStatus::BudgetExhausted);
            assert!(fill.accepted < fill.requested);
            assert_eq!(fill.attempts, 200 * 5);
            assert!(fill.rejected_too_close > 0);
        }
        assert_eq!(outcome.shortfall(), outcome.fills.iter().map(|f| 200 - f.accepted).sum::<usize>());
    }

    #[test]
    fn stratum_without_anchors_is_flagged() {
        let mut cfg = anchor_group_config(10, 1);
        cfg.strata[1].anchors.clear();
        let mut registry = Registry::new();
        let outcome = run(&cfg, &mut registry);
        assert_eq!(outcome.fills[1].status, FillStatus::NoAnchors);
        assert_eq!(outcome.fills[1].accepted, 0);
        assert_eq!(outcome.fills[0].status, FillStatus::Complete);
        assert!(outcome.is_partial());
    }

    #[test]
    fn classify_policy_labels_by_coordinates() {
        let mut cfg = CensusConfig::default();
        cfg.online.samples_per_stratum = 25;
        cfg.online.label_policy = AnchorLabelPolicy::Classify;
        // One anchor straddling the high/middle threshold.
        cfg.strata[0].anchors = vec![Anchor { name: "edge".into(), lat: -23.6, lon: -46.65 }];
        cfg.strata.truncate(1);
        let rule = cfg.rule();
        let mut registry = Registry::new();
        let outcome = run(&cfg, &mut registry);
        assert!(outcome.fills[0].rejected_off_stratum > 0);
        for s in &outcome.samples {
            assert_eq!(rule.classify(s.position), s.stratum);
        }
    }

    #[test]
    fn deterministic_given_seed_and_registry() {
        let cfg = anchor_group_config(20, 11);
        let a = run(&cfg, &mut Registry::new());
        let b = run(&cfg, &mut Registry::new());
        assert_eq!(a, b);
    }

    #[test]
    fn jitter_stays_inside_box() {
        let cfg = anchor_group_config(30, 2);
        let outcome = run(&cfg, &mut Registry::new());
        for s in &outcome.samples {
            let SampleOrigin::Jittered { anchor } = &s.origin else {
                panic!("online sample without anchor");
            };
            let a = cfg
                .strata
                .iter()
                .flat_map(|st| st.anchors.iter())
                .find(|x| &x.name == anchor)
                .unwrap();
            assert!((s.position.lat - a.lat).abs() <= cfg.online.jitter_deg + 1e-12);
            assert!((s.position.lon - a.lon).abs() <= cfg.online.jitter_deg + 1e-12);
        }
    }

    #[cfg(feature = "threading")]
    #[test]
    fn parallel_sampling_keeps_separation() {
        use crate::sampling::registry::SharedRegistry;
        let mut cfg = anchor_group_config(80, 4);
        cfg.online.min_separation_m = 300.0;
        let shared = SharedRegistry::new(Registry::new());
        let ids = IdAllocator::starting_at(1);
        let outcome = sample_online_parallel(&shared, &ids, &cfg.strata, &cfg.rule(), &cfg.online);
        let registry = shared.into_inner();
        assert_eq!(registry.len(), outcome.samples.len());
        assert_separated(registry.records(), cfg.online.min_separation_m);
    }
}
