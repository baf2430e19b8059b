//! Error kinds for the ingestion and archival passes
//!
//! Only `PipelineError` ever escapes a pass entry point. The other kinds are
//! caught at the smallest safe scope (file, candidate, pass) and recorded in
//! the run summary as `RunFailure`s.

use super::types::{DetectionId, DetectionKey, SatelliteId};
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Failure reported by a `PersistenceGateway`
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("unique constraint violated: {0}")]
    Conflict(String),
    #[error("detection {0} not found")]
    MissingDetection(DetectionId),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("value out of range: {0}")]
    OutOfRange(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Malformed row or unreadable feed file. Scope: the file.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no data in file {0}")]
    EmptyFile(PathBuf),
    #[error("csv error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("malformed row at {path}:{line}: {reason}")]
    Row {
        path: PathBuf,
        line: u64,
        reason: String,
    },
}

/// Containment or association lookup failed. Scope: the candidate.
#[derive(Debug, Error)]
#[error("spatial query failed: {0}")]
pub struct SpatialQueryError(#[from] pub StoreError);

/// Lookup, insert or update of a detection failed. Scope: the candidate.
#[derive(Debug, Error)]
#[error("reconciliation write failed for {key} from {source_id}: {cause}")]
pub struct ReconciliationWriteError {
    pub key: DetectionKey,
    pub source_id: SatelliteId,
    #[source]
    pub cause: StoreError,
}

/// Archival step that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ArchivalStep {
    Begin,
    Cutoff,
    SelectCandidates,
    ArchiveDetection,
    MigrateLinks,
    Purge,
    Commit,
}

/// Any archival step failed; the whole pass was rolled back. Scope: the pass.
#[derive(Debug, Error)]
#[error("archival failed at {step:?}: {source}")]
pub struct ArchivalFailure {
    pub step: ArchivalStep,
    #[source]
    pub source: StoreError,
}

/// Run-level failure: the pass could not start at all
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("another pipeline run holds the lock at {0}")]
    AlreadyRunning(PathBuf),
    #[error("run lock io error: {0}")]
    Lock(#[from] std::io::Error),
    #[error("failed to preload geometry: {0}")]
    GeometryPreload(#[source] StoreError),
    #[error(transparent)]
    Archival(#[from] ArchivalFailure),
}
