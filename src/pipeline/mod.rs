//! # FIRMS fire-detection pipeline
//!
//! Ingests satellite active-fire CSV batches, keeps one live detection per
//! exact (latitude, longitude, date, time) key with the set of satellites
//! that reported it, links new detections to the forestry parcels they fall
//! in, and moves detections older than the retention window into the
//! archive.
//!
//! ## Flow
//!
//! ```text
//! FeedReader ─▶ RegionFilter ─▶ RecordReconciler ─▶ PersistenceGateway
//!      │                              │
//!      └─▶ SnapshotBuilder            └─▶ ForestryAssociator (new rows only)
//!
//! ArchivalEngine: live ─▶ archived ─▶ purged, one transaction per pass
//! ```
//!
//! ## Module Organization
//!
//! - `types` / `decimal` - Detection keys, provenance, exact decimals
//! - `feed_reader` - Directory discovery and CSV row parsing
//! - `geometry` / `spatial` - Polygon containment and lookup strategies
//! - `region` / `forestry` - Region filter and parcel association
//! - `reconciler` - New detection vs provenance merge
//! - `snapshot` - Keys observed during a run
//! - `ingestion` / `archival` - The two passes
//! - `db` - Gateway traits; `sqlite_store` and `memory_store` implement them
//! - `engine` - Run orchestration under the run `lock`

pub mod archival;
pub mod config;
pub mod db;
pub mod decimal;
pub mod engine;
pub mod error;
pub mod feed_reader;
pub mod forestry;
pub mod geometry;
pub mod ingestion;
pub mod lock;
pub mod memory_store;
pub mod reconciler;
pub mod region;
pub mod snapshot;
pub mod spatial;
pub mod sqlite_store;
pub mod types;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use archival::{ArchivalEngine, ArchivalReport};
pub use config::PipelineConfig;
pub use db::{ArchivalSession, PersistenceGateway};
pub use engine::{ArchivalOutcome, PipelineEngine, RunSummary};
pub use error::{PipelineError, StoreError};
pub use ingestion::IngestionSummary;
pub use memory_store::MemoryGateway;
pub use sqlite_store::SqliteGateway;
pub use types::{DetectionKey, Provenance, SatelliteId};
