//! Geographic coordinate types and distance math.
//! All coordinate math uses f64 for precision.

use serde::{Deserialize, Serialize};

/// Mean Earth radius in metres used by [`haversine_m`].
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Metres per degree of latitude on the [`EARTH_RADIUS_M`] sphere.
pub const METRES_PER_DEG_LAT: f64 = EARTH_RADIUS_M * std::f64::consts::PI / 180.0;

/// A point on the sphere in geographic coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLon {
    /// Latitude in degrees, -90 to +90.
    pub lat: f64,
    /// Longitude in degrees, -180 to +180.
    pub lon: f64,
}

impl LatLon {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Convert to radians.
    pub fn to_radians(self) -> (f64, f64) {
        (self.lat.to_radians(), self.lon.to_radians())
    }

    /// Great-circle distance to `other` in metres.
    pub fn distance_m(self, other: LatLon) -> f64 {
        haversine_m(self, other)
    }
}

/// Axis-aligned lat/lon rectangle. `min_*` edges are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl Bounds {
    pub fn new(min_lat: f64, max_lat: f64, min_lon: f64, max_lon: f64) -> Self {
        Self { min_lat, max_lat, min_lon, max_lon }
    }

    pub fn center(&self) -> LatLon {
        LatLon::new(
            (self.min_lat + self.max_lat) / 2.0,
            (self.min_lon + self.max_lon) / 2.0,
        )
    }

    pub fn lat_span(&self) -> f64 {
        self.max_lat - self.min_lat
    }

    pub fn lon_span(&self) -> f64 {
        self.max_lon - self.min_lon
    }

    pub fn contains(&self, p: LatLon) -> bool {
        p.lat >= self.min_lat && p.lat <= self.max_lat && p.lon >= self.min_lon && p.lon <= self.max_lon
    }

    /// True when the two rectangles share interior area. Touching edges do not count.
    pub fn overlaps(&self, other: &Bounds) -> bool {
        self.min_lat < other.max_lat
            && other.min_lat < self.max_lat
            && self.min_lon < other.max_lon
            && other.min_lon < self.max_lon
    }
}

/// Fixed kilometre-per-degree conversion around a reference latitude.
///
/// This is a flat approximation, not a projection: one degree of longitude is
/// treated as the same length everywhere in the region, which is adequate for
/// city-sized extents and degrades as the extent grows.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DegreeScale {
    pub km_per_deg_lat: f64,
    pub km_per_deg_lon: f64,
}

impl DegreeScale {
    pub fn lat_step(&self, km: f64) -> f64 {
        km / self.km_per_deg_lat
    }

    pub fn lon_step(&self, km: f64) -> f64 {
        km / self.km_per_deg_lon
    }
}

impl Default for DegreeScale {
    /// 111 km per degree of latitude, 96 km per degree of longitude (≈ 23.5°S).
    fn default() -> Self {
        Self { km_per_deg_lat: 111.0, km_per_deg_lon: 96.0 }
    }
}

/// Haversine great-circle distance in metres.
///
/// `d = 2R·asin(√(sin²(Δφ/2) + cos φ1·cos φ2·sin²(Δλ/2)))`
pub fn haversine_m(a: LatLon, b: LatLon) -> f64 {
    let (phi1, lambda1) = a.to_radians();
    let (phi2, lambda2) = b.to_radians();
    let dphi = phi2 - phi1;
    let dlambda = lambda2 - lambda1;
    let h = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    // Rounding can push h a hair above 1 for antipodal points.
    2.0 * EARTH_RADIUS_M * h.clamp(0.0, 1.0).sqrt().asin()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn haversine_zero_for_identical_points() {
        let p = LatLon::new(-23.55, -46.63);
        assert_eq!(haversine_m(p, p), 0.0);
    }

    #[test]
    fn haversine_symmetric() {
        let mut rng_state: u64 = 7;
        for _ in 0..500 {
            // LCG for deterministic pseudo-random
            rng_state = rng_state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let lat1 = (rng_state as f64 / u64::MAX as f64) * 170.0 - 85.0;
            rng_state = rng_state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let lon1 = (rng_state as f64 / u64::MAX as f64) * 360.0 - 180.0;
            rng_state = rng_state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let lat2 = (rng_state as f64 / u64::MAX as f64) * 170.0 - 85.0;
            rng_state = rng_state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let lon2 = (rng_state as f64 / u64::MAX as f64) * 360.0 - 180.0;

            let a = LatLon::new(lat1, lon1);
            let b = LatLon::new(lat2, lon2);
            assert_relative_eq!(haversine_m(a, b), haversine_m(b, a), max_relative = 1e-14);
        }
    }

    #[test]
    fn one_degree_of_latitude() {
        let d = haversine_m(LatLon::new(0.0, 0.0), LatLon::new(1.0, 0.0));
        assert_relative_eq!(d, METRES_PER_DEG_LAT, max_relative = 1e-12);
    }

    /// Three points along one meridian: AB + BC == AC.
    #[test]
    fn collinear_points_are_additive() {
        let a = LatLon::new(-23.70, -46.60);
        let b = LatLon::new(-23.65, -46.60);
        let c = LatLon::new(-23.55, -46.60);
        let ab = haversine_m(a, b);
        let bc = haversine_m(b, c);
        let ac = haversine_m(a, c);
        assert_relative_eq!(ab + bc, ac, max_relative = 1e-9);
        assert_relative_eq!(ab, 0.05 * METRES_PER_DEG_LAT, max_relative = 1e-9);
        assert_relative_eq!(bc, 0.10 * METRES_PER_DEG_LAT, max_relative = 1e-9);
    }

    #[test]
    fn antipodal_distance_is_half_circumference() {
        let d = haversine_m(LatLon::new(90.0, 0.0), LatLon::new(-90.0, 0.0));
        assert_relative_eq!(d, std::f64::consts::PI * EARTH_RADIUS_M, max_relative = 1e-12);
    }

    #[test]
    fn touching_bounds_do_not_overlap() {
        let a = Bounds::new(0.0, 1.0, 0.0, 1.0);
        let b = Bounds::new(0.0, 1.0, 1.0, 2.0);
        let c = Bounds::new(0.5, 1.5, 0.5, 1.5);
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
    }

    #[test]
    fn degree_scale_steps() {
        let s = DegreeScale::default();
        assert_relative_eq!(s.lat_step(111.0), 1.0);
        assert_relative_eq!(s.lon_step(48.0), 0.5);
    }
}
