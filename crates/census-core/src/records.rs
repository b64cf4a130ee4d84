//! Row types exchanged with the acquisition service and the detector.

use serde::{Deserialize, Serialize};

use crate::coords::LatLon;
use crate::strata::Stratum;

/// Where a [`Sample`] came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleOrigin {
    /// A batch draw of the grid cell with this id.
    GridCell { cell_id: u64 },
    /// An online draw jittered around the named anchor.
    Jittered { anchor: String },
}

/// A location selected for acquisition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Location id from the registry's [`IdAllocator`](crate::sampling::IdAllocator).
    pub id: u64,
    pub position: LatLon,
    pub stratum: Stratum,
    pub origin: SampleOrigin,
}

/// One row of the persisted registry, written by the acquisition service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    #[serde(alias = "cell_id")]
    pub location_id: u64,
    pub lat: f64,
    pub lon: f64,
    pub stratum: Stratum,
    /// Path of the acquired image; absent when acquisition failed or is pending.
    #[serde(rename = "filepath")]
    pub artifact_path: Option<String>,
    #[serde(deserialize_with = "flexible_bool")]
    pub success: bool,
}

impl MetadataRecord {
    pub fn position(&self) -> LatLon {
        LatLon::new(self.lat, self.lon)
    }

    /// A registry entry for a freshly accepted sample that has not been acquired yet.
    pub fn pending(sample: &Sample) -> Self {
        Self {
            location_id: sample.id,
            lat: sample.position.lat,
            lon: sample.position.lon,
            stratum: sample.stratum.clone(),
            artifact_path: None,
            success: false,
        }
    }
}

/// One bounding box reported by the detector.
///
/// Box geometry is kept in whatever frame the detector used (normalized or
/// pixels); it only has to be consistent within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    #[serde(rename = "image")]
    pub image_reference: String,
    #[serde(rename = "class")]
    pub class_label: String,
    pub confidence: f64,
    #[serde(rename = "x_center")]
    pub bbox_center_x: f64,
    #[serde(rename = "y_center")]
    pub bbox_center_y: f64,
    #[serde(rename = "width")]
    pub bbox_width: f64,
    #[serde(rename = "height")]
    pub bbox_height: f64,
}

/// Accepts `true`/`false` in any case, and `1`/`0`.
fn flexible_bool<'de, D: serde::Deserializer<'de>>(d: D) -> std::result::Result<bool, D::Error> {
    let raw = String::deserialize(d)?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" | "" => Ok(false),
        other => Err(serde::de::Error::custom(format!("expected a boolean, got `{other}`"))),
    }
}
