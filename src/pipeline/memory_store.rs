//! In-memory `PersistenceGateway` for tests
//!
//! Mirrors the SQLite store's semantics (unique keys, duplicate-tolerant
//! link migration, transactional archival) and lets tests inject failures at
//! named points.

use super::db::{ArchivalSession, ArchiveWrite, PersistenceGateway};
use super::error::StoreError;
use super::geometry::MultiPolygon;
use super::snapshot::RunSnapshot;
use super::types::{
    ArchivedDetectionId, CoordinateTolerance, DetectionId, DetectionKey, GeoPoint, LiveMatch,
    NewDetection, ParcelId, Provenance,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Where an injected failure fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    Lookup,
    CreateDetection,
    UpdateProvenance,
    SpatialQuery,
    LoadGeometry,
    Snapshot,
    BeginArchival,
    ArchiveDetection,
    MigrateLinks,
    Purge,
    Commit,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArchivedRecord {
    pub detection: NewDetection,
    pub source_detection_id: DetectionId,
    pub archived_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    next_detection_id: i64,
    next_archived_id: i64,
    live: BTreeMap<DetectionId, NewDetection>,
    archived: BTreeMap<ArchivedDetectionId, ArchivedRecord>,
    links: BTreeSet<(DetectionId, ParcelId)>,
    archived_links: BTreeSet<(ArchivedDetectionId, ParcelId)>,
    regions: Vec<MultiPolygon>,
    parcels: Vec<(ParcelId, MultiPolygon)>,
    snapshot: Option<RunSnapshot>,
}

impl MemoryState {
    fn insert_live(&mut self, detection: &NewDetection, parcels: &[ParcelId]) -> Result<DetectionId, StoreError> {
        if self.live.values().any(|d| d.fire.key == detection.fire.key) {
            return Err(StoreError::Conflict(format!("live detection {}", detection.fire.key)));
        }
        self.next_detection_id += 1;
        let id = DetectionId(self.next_detection_id);
        self.live.insert(id, detection.clone());
        for parcel in parcels {
            self.links.insert((id, *parcel));
        }
        Ok(id)
    }
}

#[derive(Debug, Default)]
struct Faults {
    points: HashSet<FailPoint>,
    create_keys: HashSet<DetectionKey>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn check(faults: &Mutex<Faults>, point: FailPoint) -> Result<(), StoreError> {
    if guard(faults).points.contains(&point) {
        return Err(StoreError::Unavailable(format!("injected failure at {:?}", point)));
    }
    Ok(())
}

#[derive(Clone, Default)]
pub struct MemoryGateway {
    state: Arc<Mutex<MemoryState>>,
    faults: Arc<Mutex<Faults>>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_region(&self, region: MultiPolygon) {
        guard(&self.state).regions.push(region);
    }

    pub fn add_parcel(&self, id: ParcelId, geometry: MultiPolygon) {
        guard(&self.state).parcels.push((id, geometry));
    }

    pub fn fail(&self, point: FailPoint) {
        guard(&self.faults).points.insert(point);
    }

    /// `create_detection` fails only for this key
    pub fn fail_create_for(&self, key: DetectionKey) {
        guard(&self.faults).create_keys.insert(key);
    }

    pub fn clear_failures(&self) {
        let mut faults = guard(&self.faults);
        faults.points.clear();
        faults.create_keys.clear();
    }

    /// Seeds a live detection, bypassing injected failures
    pub fn seed_live(&self, detection: NewDetection, parcels: &[ParcelId]) -> DetectionId {
        guard(&self.state)
            .insert_live(&detection, parcels)
            .unwrap_or_else(|e| panic!("seed_live: {}", e))
    }

    pub fn live_detections(&self) -> Vec<(DetectionId, NewDetection)> {
        guard(&self.state)
            .live
            .iter()
            .map(|(id, d)| (*id, d.clone()))
            .collect()
    }

    pub fn archived_detections(&self) -> Vec<(ArchivedDetectionId, ArchivedRecord)> {
        guard(&self.state)
            .archived
            .iter()
            .map(|(id, r)| (*id, r.clone()))
            .collect()
    }

    pub fn links(&self) -> Vec<(DetectionId, ParcelId)> {
        guard(&self.state).links.iter().copied().collect()
    }

    pub fn archived_links(&self) -> Vec<(ArchivedDetectionId, ParcelId)> {
        guard(&self.state).archived_links.iter().copied().collect()
    }

    pub fn snapshot(&self) -> Option<RunSnapshot> {
        guard(&self.state).snapshot.clone()
    }
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    async fn find_live_detection(
        &self,
        key: &DetectionKey,
        tolerance: CoordinateTolerance,
    ) -> Result<Option<LiveMatch>, StoreError> {
        check(&self.faults, FailPoint::Lookup)?;
        let state = guard(&self.state);

        let best = state
            .live
            .iter()
            .filter(|(_, d)| tolerance.matches(&d.fire.key, key))
            .min_by_key(|(id, d)| {
                let distance = (
                    d.fire.key.latitude.abs_diff(&key.latitude),
                    d.fire.key.longitude.abs_diff(&key.longitude),
                );
                (distance, **id)
            });

        Ok(best.map(|(id, d)| LiveMatch {
            id: *id,
            key: d.fire.key.clone(),
            provenance: d.provenance.clone(),
        }))
    }

    async fn create_detection(
        &self,
        detection: &NewDetection,
        parcels: &[ParcelId],
    ) -> Result<DetectionId, StoreError> {
        check(&self.faults, FailPoint::CreateDetection)?;
        if guard(&self.faults).create_keys.contains(&detection.fire.key) {
            return Err(StoreError::Unavailable(format!(
                "injected failure creating {}",
                detection.fire.key
            )));
        }
        guard(&self.state).insert_live(detection, parcels)
    }

    async fn update_provenance(
        &self,
        id: DetectionId,
        provenance: &Provenance,
    ) -> Result<(), StoreError> {
        check(&self.faults, FailPoint::UpdateProvenance)?;
        let mut state = guard(&self.state);
        let detection = state.live.get_mut(&id).ok_or(StoreError::MissingDetection(id))?;
        detection.provenance = provenance.clone();
        Ok(())
    }

    async fn region_contains(&self, point: GeoPoint) -> Result<bool, StoreError> {
        check(&self.faults, FailPoint::SpatialQuery)?;
        Ok(guard(&self.state).regions.iter().any(|r| r.contains(point)))
    }

    async fn parcels_containing(&self, point: GeoPoint) -> Result<Vec<ParcelId>, StoreError> {
        check(&self.faults, FailPoint::SpatialQuery)?;
        Ok(guard(&self.state)
            .parcels
            .iter()
            .filter(|(_, g)| g.contains(point))
            .map(|(id, _)| *id)
            .collect())
    }

    async fn load_region_boundaries(&self) -> Result<Vec<MultiPolygon>, StoreError> {
        check(&self.faults, FailPoint::LoadGeometry)?;
        Ok(guard(&self.state).regions.clone())
    }

    async fn load_forestry_parcels(&self) -> Result<Vec<(ParcelId, MultiPolygon)>, StoreError> {
        check(&self.faults, FailPoint::LoadGeometry)?;
        Ok(guard(&self.state).parcels.clone())
    }

    async fn materialize_snapshot(&self, snapshot: &RunSnapshot) -> Result<usize, StoreError> {
        check(&self.faults, FailPoint::Snapshot)?;
        guard(&self.state).snapshot = Some(snapshot.clone());
        Ok(snapshot.len())
    }

    async fn discard_snapshot(&self) -> Result<(), StoreError> {
        guard(&self.state).snapshot = None;
        Ok(())
    }

    async fn begin_archival(&self) -> Result<Box<dyn ArchivalSession>, StoreError> {
        check(&self.faults, FailPoint::BeginArchival)?;
        let work = guard(&self.state).clone();
        Ok(Box::new(MemoryArchivalSession {
            shared: self.state.clone(),
            faults: self.faults.clone(),
            work,
        }))
    }
}

/// Works on a private copy of the state; `commit` swaps it in
struct MemoryArchivalSession {
    shared: Arc<Mutex<MemoryState>>,
    faults: Arc<Mutex<Faults>>,
    work: MemoryState,
}

#[async_trait]
impl ArchivalSession for MemoryArchivalSession {
    async fn latest_acquisition(&mut self) -> Result<Option<NaiveDateTime>, StoreError> {
        Ok(self.work.live.values().map(|d| d.fire.key.acquired_at()).max())
    }

    async fn select_candidates(
        &mut self,
        cutoff: NaiveDateTime,
    ) -> Result<Vec<DetectionId>, StoreError> {
        Ok(self
            .work
            .live
            .iter()
            .filter(|(_, d)| d.fire.key.acquired_at() < cutoff)
            .map(|(id, _)| *id)
            .collect())
    }

    async fn archive_detection(
        &mut self,
        id: DetectionId,
        archived_at: DateTime<Utc>,
    ) -> Result<ArchiveWrite, StoreError> {
        check(&self.faults, FailPoint::ArchiveDetection)?;
        let detection = self
            .work
            .live
            .get(&id)
            .cloned()
            .ok_or(StoreError::MissingDetection(id))?;

        if let Some((existing, _)) = self
            .work
            .archived
            .iter()
            .find(|(_, r)| r.detection.fire.key == detection.fire.key)
        {
            return Ok(ArchiveWrite::Existing(*existing));
        }

        self.work.next_archived_id += 1;
        let archived_id = ArchivedDetectionId(self.work.next_archived_id);
        self.work.archived.insert(
            archived_id,
            ArchivedRecord {
                detection,
                source_detection_id: id,
                archived_at,
            },
        );
        Ok(ArchiveWrite::Inserted(archived_id))
    }

    async fn migrate_links(
        &mut self,
        from: DetectionId,
        to: ArchivedDetectionId,
    ) -> Result<usize, StoreError> {
        check(&self.faults, FailPoint::MigrateLinks)?;
        let parcels: Vec<ParcelId> = self
            .work
            .links
            .iter()
            .filter(|(d, _)| *d == from)
            .map(|(_, p)| *p)
            .collect();

        let mut written = 0;
        for parcel in parcels {
            if self.work.archived_links.insert((to, parcel)) {
                written += 1;
            }
        }
        Ok(written)
    }

    async fn purge(&mut self, ids: &[DetectionId]) -> Result<usize, StoreError> {
        check(&self.faults, FailPoint::Purge)?;
        let doomed: HashSet<DetectionId> = ids.iter().copied().collect();
        self.work.links.retain(|(d, _)| !doomed.contains(d));
        let before = self.work.live.len();
        self.work.live.retain(|id, _| !doomed.contains(id));
        Ok(before - self.work.live.len())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        check(&self.faults, FailPoint::Commit)?;
        let MemoryArchivalSession { shared, work, .. } = *self;
        *guard(&shared) = work;
        Ok(())
    }
}
