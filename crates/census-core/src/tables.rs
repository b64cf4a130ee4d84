//! CSV and JSON files exchanged with the acquisition service and the detector.
//!
//! Readers check the header for every required column before touching a row,
//! so a wrong file fails with the column it lacks rather than a per-row error.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{CensusError, Result};
use crate::estimate::{render_summary, Estimate, EstimationRow, MatchedDetection};
use crate::grid::GridCell;
use crate::records::{DetectionRecord, MetadataRecord, Sample};
use crate::strata::Stratum;

/// Required registry columns; each entry lists accepted spellings.
const REGISTRY_COLUMNS: &[&[&str]] = &[
    &["location_id", "cell_id"],
    &["lat"],
    &["lon"],
    &["stratum"],
    &["success"],
];

const DETECTION_COLUMNS: &[&[&str]] = &[
    &["image"],
    &["class"],
    &["confidence"],
    &["x_center"],
    &["y_center"],
    &["width"],
    &["height"],
];

const MANIFEST_COLUMNS: &[&[&str]] = &[&["cell_id"], &["center_lat"], &["center_lon"], &["stratum"]];

/// One row of a sampling manifest handed to the acquisition service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestRow {
    pub cell_id: u64,
    pub center_lat: f64,
    pub center_lon: f64,
    pub stratum: Stratum,
}

impl From<&Sample> for ManifestRow {
    fn from(s: &Sample) -> Self {
        Self {
            cell_id: s.id,
            center_lat: s.position.lat,
            center_lon: s.position.lon,
            stratum: s.stratum.clone(),
        }
    }
}

#[derive(Serialize)]
struct GridRow<'a> {
    cell_id: u64,
    min_lat: f64,
    max_lat: f64,
    min_lon: f64,
    max_lon: f64,
    center_lat: f64,
    center_lon: f64,
    area_km2: f64,
    stratum: &'a str,
}

// ── Readers ──────────────────────────────────────────────────────────────────

pub fn read_registry(path: &Path) -> Result<Vec<MetadataRecord>> {
    read_table(path, REGISTRY_COLUMNS)
}

pub fn read_detections(path: &Path) -> Result<Vec<DetectionRecord>> {
    read_table(path, DETECTION_COLUMNS)
}

pub fn read_manifest(path: &Path) -> Result<Vec<ManifestRow>> {
    read_table(path, MANIFEST_COLUMNS)
}

fn read_table<T: DeserializeOwned>(path: &Path, required: &[&[&str]]) -> Result<Vec<T>> {
    let csv_err = |source| CensusError::Csv { path: path.to_path_buf(), source };
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(csv_err)?;

    let headers = rdr.headers().map_err(csv_err)?.clone();
    for spellings in required {
        if !spellings.iter().any(|name| headers.iter().any(|h| h == *name)) {
            return Err(CensusError::MissingColumn {
                file: path.to_path_buf(),
                column: spellings[0].to_string(),
            });
        }
    }

    let mut rows = Vec::new();
    for result in rdr.deserialize() {
        rows.push(result.map_err(|e| row_error(path, e))?);
    }
    Ok(rows)
}

fn row_error(path: &Path, err: csv::Error) -> CensusError {
    match err.position().map(|p| p.line()) {
        Some(line) => CensusError::MalformedRow {
            file: path.to_path_buf(),
            line,
            message: err.to_string(),
        },
        None => CensusError::Csv { path: path.to_path_buf(), source: err },
    }
}

// ── Writers ──────────────────────────────────────────────────────────────────

pub fn write_manifest(path: &Path, samples: &[Sample]) -> Result<()> {
    write_rows(path, samples.iter().map(ManifestRow::from))
}

/// Full cell geometry, one row per cell; unclassified cells get an empty stratum.
pub fn write_grid(path: &Path, cells: &[GridCell]) -> Result<()> {
    write_rows(
        path,
        cells.iter().map(|c| GridRow {
            cell_id: c.id,
            min_lat: c.bounds.min_lat,
            max_lat: c.bounds.max_lat,
            min_lon: c.bounds.min_lon,
            max_lon: c.bounds.max_lon,
            center_lat: c.center.lat,
            center_lon: c.center.lon,
            area_km2: c.area_km2,
            stratum: c.stratum.as_ref().map_or("", Stratum::as_str),
        }),
    )
}

pub fn write_registry(path: &Path, records: &[MetadataRecord]) -> Result<()> {
    write_rows(path, records.iter())
}

pub fn write_estimate_rows(path: &Path, rows: &[EstimationRow]) -> Result<()> {
    write_rows(path, rows.iter())
}

pub fn write_matched_points(path: &Path, points: &[MatchedDetection]) -> Result<()> {
    write_rows(path, points.iter())
}

fn write_rows<T: Serialize>(path: &Path, rows: impl IntoIterator<Item = T>) -> Result<()> {
    let csv_err = |source| CensusError::Csv { path: path.to_path_buf(), source };
    let mut wtr = csv::Writer::from_path(path).map_err(csv_err)?;
    for row in rows {
        wtr.serialize(row).map_err(csv_err)?;
    }
    wtr.flush().map_err(|source| CensusError::Io { path: path.to_path_buf(), source })
}

/// The human-readable estimate summary, as printed by the estimator.
pub fn write_summary(path: &Path, est: &Estimate) -> Result<()> {
    fs::write(path, render_summary(est)).map_err(|source| CensusError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Pretty-printed JSON, as written for reports and resolved configs.
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let file = File::create(path).map_err(|source| CensusError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::to_writer_pretty(BufWriter::new(file), value).map_err(|source| CensusError::Json {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coords::LatLon;
    use crate::config::CensusConfig;
    use crate::records::{MetadataRecord, SampleOrigin};
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn registry_accepts_cell_id_alias_and_flexible_bools() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metadata.csv");
        fs::write(
            &path,
            "cell_id,lat,lon,stratum,filepath,success\n\
             3,-23.59,-46.68,high_income,dataset\\raw_images\\cell_3.jpg,True\n\
             4,-23.70,-46.45,low_income,,False\n\
             5,-23.61,-46.60,middle_income,dataset/raw_images/cell_5.jpg,1\n",
        )
        .unwrap();
        let rows = read_registry(&path).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].location_id, 3);
        assert!(rows[0].success);
        assert_eq!(rows[0].artifact_path.as_deref(), Some("dataset\\raw_images\\cell_3.jpg"));
        assert!(!rows[1].success);
        assert_eq!(rows[1].artifact_path, None);
        assert!(rows[2].success);
    }

    #[test]
    fn missing_column_is_named() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("detections.csv");
        fs::write(&path, "image,class,x_center,y_center,width,height\ncell_1.jpg,pool,1,1,1,1\n").unwrap();
        match read_detections(&path).unwrap_err() {
            CensusError::MissingColumn { file, column } => {
                assert_eq!(column, "confidence");
                assert_eq!(file, path);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn malformed_row_reports_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("detections.csv");
        fs::write(
            &path,
            "image,class,confidence,x_center,y_center,width,height\n\
             cell_1.jpg,pool,0.9,10,10,5,5\n\
             cell_2.jpg,pool,high,10,10,5,5\n",
        )
        .unwrap();
        match read_detections(&path).unwrap_err() {
            CensusError::MalformedRow { line, .. } => assert_eq!(line, 3),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_file_is_an_error_naming_it() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent.csv");
        let msg = read_registry(&path).unwrap_err().to_string();
        assert!(msg.contains("absent.csv"), "{msg}");
    }

    #[test]
    fn manifest_written_then_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("manifest.csv");
        let samples = vec![
            Sample {
                id: 12,
                position: LatLon::new(-23.6, -46.7),
                stratum: Stratum::new("high_income"),
                origin: SampleOrigin::GridCell { cell_id: 305 },
            },
            Sample {
                id: 40,
                position: LatLon::new(-23.5, -46.4),
                stratum: Stratum::new("low_income"),
                origin: SampleOrigin::Jittered { anchor: "Guaianases".into() },
            },
        ];
        write_manifest(&path, &samples).unwrap();

        let header = fs::read_to_string(&path).unwrap();
        assert!(header.starts_with("cell_id,center_lat,center_lon,stratum\n"));
        let rows = read_manifest(&path).unwrap();
        assert_eq!(rows, samples.iter().map(ManifestRow::from).collect::<Vec<_>>());
    }

    #[test]
    fn estimate_csv_has_expected_columns() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("estimate.csv");
        let row = EstimationRow {
            stratum: Stratum::new("high_income"),
            observed_area_km2: 5.0,
            observed_count: 10,
            tiles_observed: 10,
            positive_tiles: 6,
            density: 2.0,
            correction_factor: 2.0,
            area_share: 0.25,
            target_area_km2: 380.25,
            corrected_density: 4.0,
            pools_estimated: 1521.0,
        };
        write_estimate_rows(&path, &[row]).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        let header = text.lines().next().unwrap();
        assert_eq!(
            header,
            "stratum,observed_area_km2,observed_count,tiles_observed,positive_tiles,density,\
             correction_factor,area_share,target_area_km2,corrected_density,pools_estimated"
        );
        assert!(text.lines().nth(1).unwrap().starts_with("high_income,5.0,10,10,6,2.0"));
    }

    #[test]
    fn grid_rows_leave_unclassified_stratum_blank() {
        use crate::coords::{Bounds, DegreeScale};
        let dir = tempdir().unwrap();
        let path = dir.path().join("grid.csv");
        let cells = crate::grid::create_grid(Bounds::new(0.0, 0.02, 0.0, 0.02), 1.0, DegreeScale::default());
        write_grid(&path, &cells).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), cells.len() + 1);
        assert!(text.lines().nth(1).unwrap().ends_with(','));
    }

    #[test]
    fn summary_file_matches_rendered_report() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("estimate.txt");
        let metadata = vec![MetadataRecord {
            location_id: 8,
            lat: -23.6,
            lon: -46.7,
            stratum: Stratum::new("high_income"),
            artifact_path: Some("cell_8.jpg".into()),
            success: true,
        }];
        let est = crate::estimate::estimate(&[], &metadata, &CensusConfig::default()).unwrap();
        write_summary(&path, &est).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, render_summary(&est));
        assert!(text.contains("Adjusted estimate"));
    }

    #[test]
    fn summary_into_missing_directory_names_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent").join("estimate.txt");
        let est = crate::estimate::estimate(&[], &[], &CensusConfig::default()).unwrap();
        let msg = write_summary(&path, &est).unwrap_err().to_string();
        assert!(msg.contains("estimate.txt"), "{msg}");
    }
}
