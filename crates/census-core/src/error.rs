//! Error type shared by every census-core component.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CensusError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("{path}: invalid JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A table is missing a column every row needs.
    #[error("{file}: missing required column `{column}`")]
    MissingColumn { file: PathBuf, column: String },

    #[error("{file}:{line}: {message}")]
    MalformedRow {
        file: PathBuf,
        line: u64,
        message: String,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A record names a stratum the configuration does not define.
    #[error("{origin}: stratum `{stratum}` is not configured")]
    UnknownStratum { stratum: String, origin: String },
}

pub type Result<T> = std::result::Result<T, CensusError>;
