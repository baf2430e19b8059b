//! Persistence gateway: the only owner of durable state
//!
//! Every pipeline component receives the gateway explicitly. Two
//! implementations ship with the crate:
//! - `SqliteGateway` - production store (rusqlite)
//! - `MemoryGateway` - in-memory fake with failure injection, for tests
//!
//! Write units are scoped per candidate: `create_detection` inserts the
//! detection together with its forestry links, atomically. The archival pass
//! runs inside one `ArchivalSession`; dropping a session without `commit`
//! rolls back everything it wrote.

use super::error::StoreError;
use super::geometry::MultiPolygon;
use super::snapshot::RunSnapshot;
use super::types::{
    ArchivedDetectionId, CoordinateTolerance, DetectionId, DetectionKey, GeoPoint, LiveMatch,
    NewDetection, ParcelId, Provenance,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};

/// Outcome of copying one live detection into the archive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveWrite {
    /// A new archive row was written
    Inserted(ArchivedDetectionId),
    /// An archive row with the same natural key already existed
    Existing(ArchivedDetectionId),
}

impl ArchiveWrite {
    pub fn id(&self) -> ArchivedDetectionId {
        match self {
            ArchiveWrite::Inserted(id) | ArchiveWrite::Existing(id) => *id,
        }
    }
}

/// Live and archive store access
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Live detection matching `key` (within `tolerance`), if any
    ///
    /// With a non-zero tolerance the closest match wins, ties broken by
    /// lowest id.
    async fn find_live_detection(
        &self,
        key: &DetectionKey,
        tolerance: CoordinateTolerance,
    ) -> Result<Option<LiveMatch>, StoreError>;

    /// Inserts a detection and one link per parcel in a single transaction
    async fn create_detection(
        &self,
        detection: &NewDetection,
        parcels: &[ParcelId],
    ) -> Result<DetectionId, StoreError>;

    async fn update_provenance(
        &self,
        id: DetectionId,
        provenance: &Provenance,
    ) -> Result<(), StoreError>;

    /// True if any region boundary contains the point
    async fn region_contains(&self, point: GeoPoint) -> Result<bool, StoreError>;

    /// Every forestry parcel containing the point
    async fn parcels_containing(&self, point: GeoPoint) -> Result<Vec<ParcelId>, StoreError>;

    async fn load_region_boundaries(&self) -> Result<Vec<MultiPolygon>, StoreError>;

    async fn load_forestry_parcels(&self) -> Result<Vec<(ParcelId, MultiPolygon)>, StoreError>;

    /// Replaces the run's working table of observed keys; returns rows written
    async fn materialize_snapshot(&self, snapshot: &RunSnapshot) -> Result<usize, StoreError>;

    async fn discard_snapshot(&self) -> Result<(), StoreError>;

    async fn begin_archival(&self) -> Result<Box<dyn ArchivalSession>, StoreError>;
}

/// One archival pass. All writes are invisible until `commit`.
#[async_trait]
pub trait ArchivalSession: Send {
    /// Latest acquisition timestamp across live detections
    async fn latest_acquisition(&mut self) -> Result<Option<NaiveDateTime>, StoreError>;

    /// Live detections acquired strictly before `cutoff`, ordered by id
    async fn select_candidates(
        &mut self,
        cutoff: NaiveDateTime,
    ) -> Result<Vec<DetectionId>, StoreError>;

    /// Copies a live detection into the archive, resolving a natural-key
    /// conflict to the existing archive row
    async fn archive_detection(
        &mut self,
        id: DetectionId,
        archived_at: DateTime<Utc>,
    ) -> Result<ArchiveWrite, StoreError>;

    /// Copies the detection's links under the archived id, skipping pairs
    /// that already exist. Returns the number of links written.
    async fn migrate_links(
        &mut self,
        from: DetectionId,
        to: ArchivedDetectionId,
    ) -> Result<usize, StoreError>;

    /// Deletes the links and live rows of `ids`. Returns detections removed.
    async fn purge(&mut self, ids: &[DetectionId]) -> Result<usize, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}
