//! Append-only store of accepted locations, consulted by every acceptance check.
//!
//! The registry is the only mutable shared state in sampling. [`Registry`] is
//! the single-writer form; [`SharedRegistry`] puts the check and the append
//! under one lock so concurrent samplers never judge a candidate against a
//! stale view.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::coords::{haversine_m, LatLon, METRES_PER_DEG_LAT};
use crate::records::MetadataRecord;

/// Side of one spatial bucket, in degrees (≈ 1.1 km north–south).
const DEFAULT_BUCKET_DEG: f64 = 0.01;

/// Widening applied to the longitude reach of a query.
const LON_REACH_MARGIN: f64 = 1.1;

/// Narrow interface the samplers need from a registry.
pub trait SampleRegistry {
    /// True if any stored location lies within `radius_m` of `point` (inclusive).
    fn contains_within(&self, point: LatLon, radius_m: f64) -> bool;

    fn append(&mut self, record: MetadataRecord);

    /// Append `record` only if nothing stored is within `min_separation_m`.
    fn try_accept(&mut self, record: MetadataRecord, min_separation_m: f64) -> bool {
        if self.contains_within(record.position(), min_separation_m) {
            return false;
        }
        self.append(record);
        true
    }
}

/// In-memory registry with a lat/lon grid-hash index.
#[derive(Debug, Clone)]
pub struct Registry {
    records: Vec<MetadataRecord>,
    buckets: HashMap<(i64, i64), Vec<usize>>,
    bucket_deg: f64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_bucket_deg(DEFAULT_BUCKET_DEG)
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bucket_deg(bucket_deg: f64) -> Self {
        Self { records: Vec::new(), buckets: HashMap::new(), bucket_deg }
    }

    /// Seed the registry with previously persisted records, e.g. to resume a run.
    pub fn from_records(records: impl IntoIterator<Item = MetadataRecord>) -> Self {
        let mut registry = Self::new();
        for record in records {
            registry.append(record);
        }
        registry
    }

    pub fn records(&self) -> &[MetadataRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn max_location_id(&self) -> Option<u64> {
        self.records.iter().map(|r| r.location_id).max()
    }

    pub fn into_records(self) -> Vec<MetadataRecord> {
        self.records
    }

    fn bucket_of(&self, p: LatLon) -> (i64, i64) {
        (
            (p.lat / self.bucket_deg).floor() as i64,
            (p.lon / self.bucket_deg).floor() as i64,
        )
    }

    fn scan_all(&self, point: LatLon, radius_m: f64) -> bool {
        self.records
            .iter()
            .any(|r| haversine_m(point, r.position()) <= radius_m)
    }
}

impl SampleRegistry for Registry {
    fn contains_within(&self, point: LatLon, radius_m: f64) -> bool {
        if self.records.is_empty() {
            return false;
        }
        let lat_reach = radius_m / METRES_PER_DEG_LAT;
        let max_abs_lat = (point.lat.abs() + lat_reach).min(90.0);
        let cos_lat = max_abs_lat.to_radians().cos();
        if cos_lat < 1e-6 {
            return self.scan_all(point, radius_m);
        }
        let lon_reach = lat_reach / cos_lat * LON_REACH_MARGIN;
        // Buckets do not wrap at ±180°.
        if point.lon - lon_reach < -180.0 || point.lon + lon_reach > 180.0 {
            return self.scan_all(point, radius_m);
        }

        let (r0, c0) = self.bucket_of(LatLon::new(point.lat - lat_reach, point.lon - lon_reach));
        let (r1, c1) = self.bucket_of(LatLon::new(point.lat + lat_reach, point.lon + lon_reach));
        // A huge window costs more than a straight scan.
        let window = (r1 - r0 + 1).saturating_mul(c1 - c0 + 1);
        if window as usize > self.records.len() {
            return self.scan_all(point, radius_m);
        }

        for r in r0..=r1 {
            for c in c0..=c1 {
                let Some(indices) = self.buckets.get(&(r, c)) else {
                    continue;
                };
                if indices
                    .iter()
                    .any(|&i| haversine_m(point, self.records[i].position()) <= radius_m)
                {
                    return true;
                }
            }
        }
        false
    }

    fn append(&mut self, record: MetadataRecord) {
        let key = self.bucket_of(record.position());
        self.buckets.entry(key).or_default().push(self.records.len());
        self.records.push(record);
    }
}

/// A [`Registry`] that many samplers may use at once.
#[derive(Debug, Default)]
pub struct SharedRegistry {
    inner: Mutex<Registry>,
}

impl SharedRegistry {
    pub fn new(registry: Registry) -> Self {
        Self { inner: Mutex::new(registry) }
    }

    /// Atomic check-and-append.
    pub fn try_accept(&self, record: MetadataRecord, min_separation_m: f64) -> bool {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        guard.try_accept(record, min_separation_m)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_inner(self) -> Registry {
        self.inner.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SampleRegistry for &SharedRegistry {
    fn contains_within(&self, point: LatLon, radius_m: f64) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_within(point, radius_m)
    }

    fn append(&mut self, record: MetadataRecord) {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).append(record);
    }

    fn try_accept(&mut self, record: MetadataRecord, min_separation_m: f64) -> bool {
        SharedRegistry::try_accept(self, record, min_separation_m)
    }
}

/// Hands out location ids that never repeat within a process.
///
/// Ids start after the largest id already in the registry, so they also never
/// collide with earlier runs loaded from disk.
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    pub fn starting_at(first: u64) -> Self {
        Self { next: AtomicU64::new(first) }
    }

    pub fn after(registry: &Registry) -> Self {
        Self::starting_at(registry.max_location_id().map_or(1, |id| id + 1))
    }

    pub fn allocate(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}
