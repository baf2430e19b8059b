//! Pipeline Engine - one ingestion + archival cycle
//!
//! ```text
//! RunLock::try_acquire
//!     ↓
//! SpatialIndex::preload (or per-point StoreSpatialLookup)
//!     ↓
//! IngestionPass::run -> IngestionSummary + RunSnapshot
//!     ↓
//! materialize_snapshot
//!     ↓
//! ArchivalEngine::run (skipped when the deadline was reached)
//!     ↓
//! discard_snapshot -> RunSummary
//! ```
//!
//! Every entry point takes the run lock first. Only setup failures (lock,
//! geometry preload) are returned as `Err`; everything else lands in the
//! summary.

use super::archival::{ArchivalEngine, ArchivalReport};
use super::config::PipelineConfig;
use super::db::PersistenceGateway;
use super::error::{ArchivalFailure, ArchivalStep, PipelineError};
use super::feed_reader::FeedReader;
use super::forestry::ForestryAssociator;
use super::ingestion::{FailureScope, IngestionPass, IngestionSummary, RunFailure};
use super::lock::RunLock;
use super::reconciler::RecordReconciler;
use super::region::RegionFilter;
use super::spatial::{SpatialIndex, SpatialLookup, StoreSpatialLookup};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::time::Instant;

/// What happened to the archival pass of a cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ArchivalOutcome {
    Completed(ArchivalReport),
    Failed { step: ArchivalStep, message: String },
    Skipped { reason: String },
}

/// Result of one full cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub ingestion: IngestionSummary,
    pub archival: ArchivalOutcome,
}

pub struct PipelineEngine {
    config: PipelineConfig,
    gateway: Arc<dyn PersistenceGateway>,

    /// Timestamp function (archived_at, summary times); injectable for tests
    now_fn: Box<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl PipelineEngine {
    pub fn new(config: PipelineConfig, gateway: Arc<dyn PersistenceGateway>) -> Self {
        Self::new_with_clock(config, gateway, Box::new(Utc::now))
    }

    pub fn new_with_clock(
        config: PipelineConfig,
        gateway: Arc<dyn PersistenceGateway>,
        now_fn: Box<dyn Fn() -> DateTime<Utc> + Send + Sync>,
    ) -> Self {
        Self {
            config,
            gateway,
            now_fn,
        }
    }

    /// Ingestion followed by archival
    pub async fn run_cycle(&self) -> Result<RunSummary, PipelineError> {
        let _lock = self.acquire_lock()?;
        let started_at = (self.now_fn)();
        log::info!("🚀 Starting pipeline cycle at {}", started_at);

        let ingestion = self.ingest().await?;

        let archival = if ingestion.deadline_reached {
            log::warn!("⚠️  Skipping archival: run deadline reached during ingestion");
            ArchivalOutcome::Skipped {
                reason: "run deadline reached during ingestion".to_string(),
            }
        } else {
            match self.archive().await {
                Ok(report) => ArchivalOutcome::Completed(report),
                Err(failure) => {
                    log::error!("❌ {}", failure);
                    ArchivalOutcome::Failed {
                        step: failure.step,
                        message: failure.source.to_string(),
                    }
                }
            }
        };

        self.discard_snapshot().await;

        let summary = RunSummary {
            started_at,
            finished_at: (self.now_fn)(),
            ingestion,
            archival,
        };
        log::info!(
            "✅ Cycle complete: {} files ({} failed), {} added, {} updated, {} failures recorded",
            summary.ingestion.files_processed,
            summary.ingestion.files_failed,
            summary.ingestion.added,
            summary.ingestion.updated,
            summary.ingestion.failures.len()
        );
        Ok(summary)
    }

    /// Ingestion only
    pub async fn run_ingestion(&self) -> Result<IngestionSummary, PipelineError> {
        let _lock = self.acquire_lock()?;
        let summary = self.ingest().await?;
        self.discard_snapshot().await;
        Ok(summary)
    }

    /// Archival only; a failed pass is returned as `PipelineError::Archival`
    pub async fn run_archival(&self) -> Result<ArchivalReport, PipelineError> {
        let _lock = self.acquire_lock()?;
        Ok(self.archive().await?)
    }

    fn acquire_lock(&self) -> Result<RunLock, PipelineError> {
        match RunLock::try_acquire(&self.config.lock_path)? {
            Some(lock) => {
                log::debug!("🔒 Acquired run lock {}", lock.path().display());
                Ok(lock)
            }
            None => {
                log::warn!(
                    "⚠️  Another run holds {}, not starting",
                    self.config.lock_path.display()
                );
                Err(PipelineError::AlreadyRunning(self.config.lock_path.clone()))
            }
        }
    }

    async fn spatial_lookup(&self) -> Result<Arc<dyn SpatialLookup>, PipelineError> {
        if self.config.preload_geometry {
            let index = SpatialIndex::preload(self.gateway.as_ref())
                .await
                .map_err(PipelineError::GeometryPreload)?;
            Ok(Arc::new(index))
        } else {
            log::info!("Geometry preload disabled, querying the store per point");
            Ok(Arc::new(StoreSpatialLookup::new(self.gateway.clone())))
        }
    }

    async fn ingest(&self) -> Result<IngestionSummary, PipelineError> {
        let spatial = self.spatial_lookup().await?;
        let deadline = self.config.run_deadline.and_then(|limit| {
            let deadline = Instant::now().checked_add(limit);
            if deadline.is_none() {
                log::warn!("⚠️  Run deadline of {:?} out of range, running without one", limit);
            }
            deadline
        });

        let reader = FeedReader::new(
            &self.config.download_dir,
            self.config.local_time_offset_hours,
        );
        let region = RegionFilter::new(spatial.clone());
        let reconciler = RecordReconciler::new(
            self.gateway.clone(),
            ForestryAssociator::new(spatial),
            self.config.coordinate_tolerance,
        );

        let (mut summary, snapshot) = IngestionPass::new(&reader, &region, &reconciler, deadline)
            .run()
            .await;

        match self.gateway.materialize_snapshot(&snapshot.build()).await {
            Ok(rows) => log::info!("📸 Run snapshot materialized: {} keys", rows),
            Err(err) => {
                log::error!("❌ Failed to materialize run snapshot: {}", err);
                summary = summary.record(RunFailure {
                    scope: FailureScope::Pass,
                    message: format!("snapshot: {}", err),
                });
            }
        }

        log::info!(
            "📥 Ingestion finished: {} seen, {} in region, {} added, {} updated, {} unchanged",
            summary.candidates_seen,
            summary.in_region,
            summary.added,
            summary.updated,
            summary.unchanged
        );
        Ok(summary)
    }

    async fn archive(&self) -> Result<ArchivalReport, ArchivalFailure> {
        ArchivalEngine::new(self.config.retention())
            .run(self.gateway.as_ref(), (self.now_fn)())
            .await
    }

    async fn discard_snapshot(&self) {
        if let Err(err) = self.gateway.discard_snapshot().await {
            log::warn!("Failed to discard run snapshot: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::memory_store::{FailPoint, MemoryGateway};
    use crate::pipeline::test_support::square;
    use crate::pipeline::types::ParcelId;
    use chrono::TimeZone;
    use std::fs;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    const HEADER: &str = "latitude,longitude,brightness,scan,track,acq_date,acq_time,satellite,confidence,version,bright_t31,frp,daynight";

    fn write_feed(root: &Path, satellite: &str, rows: &[&str]) {
        let dir = root.join(satellite);
        fs::create_dir_all(&dir).unwrap();
        let mut content = String::from(HEADER);
        for row in rows {
            content.push('\n');
            content.push_str(row);
        }
        fs::write(dir.join("batch.csv"), content).unwrap();
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 2, 6, 0, 0).unwrap()
    }

    fn config(dir: &TempDir) -> PipelineConfig {
        PipelineConfig {
            db_path: dir.path().join("unused.db"),
            download_dir: dir.path().join("downloads"),
            lock_path: dir.path().join("pipeline.lock"),
            ..PipelineConfig::default()
        }
    }

    fn store() -> MemoryGateway {
        let store = MemoryGateway::new();
        store.add_region(square(70.0, 50.0, 5.0));
        store.add_parcel(ParcelId(1), square(71.0, 51.0, 1.0));
        store
    }

    fn engine(config: PipelineConfig, store: &MemoryGateway) -> PipelineEngine {
        PipelineEngine::new_with_clock(config, Arc::new(store.clone()), Box::new(fixed_now))
    }

    fn seed_feeds(dir: &TempDir) {
        let downloads = dir.path().join("downloads");
        write_feed(
            &downloads,
            "A",
            &[
                "51.10,71.40,320.5,1.2,1.1,2024-05-01,0000,T,85,6.1NRT,290.1,15.3,N",
                "51.20,71.50,320.5,1.2,1.1,2024-05-01,0200,T,85,6.1NRT,290.1,15.3,N",
            ],
        );
        write_feed(
            &downloads,
            "B",
            &[
                "51.1,71.4,320.5,1.2,1.1,2024-05-01,0000,A,85,6.1NRT,290.1,15.3,N",
                "51.30,71.60,320.5,1.2,1.1,2024-05-02,0100,A,85,6.1NRT,290.1,15.3,N",
                "10.0,10.0,320.5,1.2,1.1,2024-05-02,0100,A,85,6.1NRT,290.1,15.3,N",
            ],
        );
    }

    #[tokio::test]
    async fn test_cycle_ingests_then_archives() {
        let dir = tempdir().unwrap();
        seed_feeds(&dir);
        let store = store();

        let summary = engine(config(&dir), &store).run_cycle().await.unwrap();

        assert_eq!(summary.ingestion.files_processed, 2);
        assert_eq!(summary.ingestion.candidates_seen, 5);
        assert_eq!(summary.ingestion.in_region, 4);
        assert_eq!(summary.ingestion.added, 3);
        assert_eq!(summary.ingestion.updated, 1);
        assert_eq!(summary.ingestion.snapshot_keys, 4);

        let ArchivalOutcome::Completed(report) = &summary.archival else {
            panic!("expected completed archival, got {:?}", summary.archival);
        };
        assert_eq!(report.candidates, 1);
        assert_eq!(report.archived, 1);
        assert_eq!(report.links_migrated, 1);

        let archived = store.archived_detections();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].1.detection.provenance.len(), 2);
        assert_eq!(archived[0].1.archived_at, fixed_now());
        assert_eq!(store.live_detections().len(), 2);

        // Snapshot only lives for the run
        assert!(store.snapshot().is_none());
    }

    #[tokio::test]
    async fn test_second_cycle_converges() {
        let dir = tempdir().unwrap();
        seed_feeds(&dir);
        let store = store();
        let engine = engine(config(&dir), &store);

        engine.run_cycle().await.unwrap();
        let live = store.live_detections();
        let archived = store.archived_detections();

        // The archived key is still in the feed: it comes back live and
        // resolves to the same archive row
        let second = engine.run_cycle().await.unwrap();
        assert_eq!(second.ingestion.added, 1);
        assert_eq!(second.ingestion.updated, 1);
        assert_eq!(second.ingestion.unchanged, 2);
        let ArchivalOutcome::Completed(report) = &second.archival else {
            panic!("expected completed archival, got {:?}", second.archival);
        };
        assert_eq!(report.archived, 0);
        assert_eq!(report.already_archived, 1);
        assert_eq!(report.links_migrated, 0);
        assert_eq!(store.live_detections(), live);
        assert_eq!(store.archived_detections(), archived);
    }

    #[tokio::test]
    async fn test_held_lock_refuses_every_entry_point() {
        let dir = tempdir().unwrap();
        seed_feeds(&dir);
        let store = store();
        let config = config(&dir);
        let _held = RunLock::try_acquire(&config.lock_path).unwrap().unwrap();
        let engine = engine(config, &store);

        assert!(matches!(engine.run_cycle().await, Err(PipelineError::AlreadyRunning(_))));
        assert!(matches!(engine.run_ingestion().await, Err(PipelineError::AlreadyRunning(_))));
        assert!(matches!(engine.run_archival().await, Err(PipelineError::AlreadyRunning(_))));
        assert!(store.live_detections().is_empty());
    }

    #[tokio::test]
    async fn test_deadline_skips_archival() {
        let dir = tempdir().unwrap();
        seed_feeds(&dir);
        let store = store();
        let config = PipelineConfig {
            run_deadline: Some(Duration::ZERO),
            ..config(&dir)
        };

        let summary = engine(config, &store).run_cycle().await.unwrap();
        assert!(summary.ingestion.deadline_reached);
        assert!(matches!(summary.archival, ArchivalOutcome::Skipped { .. }));
        assert!(store.archived_detections().is_empty());
    }

    #[tokio::test]
    async fn test_out_of_range_settings_never_panic() {
        let dir = tempdir().unwrap();
        seed_feeds(&dir);
        let store = store();
        let config = PipelineConfig {
            run_deadline: Some(Duration::from_secs(u64::MAX)),
            local_time_offset_hours: 9_000_000_000_000,
            retention_hours: 3_000_000_000,
            ..config(&dir)
        };

        let summary = engine(config, &store).run_cycle().await.unwrap();
        assert!(!summary.ingestion.deadline_reached);
        assert_eq!(summary.ingestion.added, 3);
        assert!(summary.ingestion.failures.is_empty());
        assert!(matches!(
            summary.archival,
            ArchivalOutcome::Failed { step: ArchivalStep::Cutoff, .. }
        ));
        assert_eq!(store.live_detections().len(), 3);
    }

    #[tokio::test]
    async fn test_archival_failure_is_reported_not_raised() {
        let dir = tempdir().unwrap();
        seed_feeds(&dir);
        let store = store();
        store.fail(FailPoint::Purge);

        let summary = engine(config(&dir), &store).run_cycle().await.unwrap();
        assert_eq!(summary.ingestion.added, 3);
        assert!(matches!(
            summary.archival,
            ArchivalOutcome::Failed { step: ArchivalStep::Purge, .. }
        ));
        assert_eq!(store.live_detections().len(), 3);
        assert!(store.archived_detections().is_empty());
    }

    #[tokio::test]
    async fn test_run_archival_raises_failure() {
        let dir = tempdir().unwrap();
        seed_feeds(&dir);
        let store = store();
        let engine = engine(config(&dir), &store);
        engine.run_ingestion().await.unwrap();

        store.fail(FailPoint::Commit);
        let err = engine.run_archival().await.unwrap_err();
        assert!(matches!(err, PipelineError::Archival(ref f) if f.step == ArchivalStep::Commit));

        store.clear_failures();
        let report = engine.run_archival().await.unwrap();
        assert_eq!(report.purged, 1);
    }

    #[tokio::test]
    async fn test_snapshot_failure_is_pass_level() {
        let dir = tempdir().unwrap();
        seed_feeds(&dir);
        let store = store();
        store.fail(FailPoint::Snapshot);

        let summary = engine(config(&dir), &store).run_ingestion().await.unwrap();
        assert_eq!(summary.added, 3);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].scope, FailureScope::Pass);
    }

    #[tokio::test]
    async fn test_geometry_preload_failure_aborts_run() {
        let dir = tempdir().unwrap();
        seed_feeds(&dir);
        let store = store();
        store.fail(FailPoint::LoadGeometry);

        let err = engine(config(&dir), &store).run_cycle().await.unwrap_err();
        assert!(matches!(err, PipelineError::GeometryPreload(_)));
        assert!(store.live_detections().is_empty());
    }

    #[tokio::test]
    async fn test_per_point_lookup_matches_preload() {
        let dir = tempdir().unwrap();
        seed_feeds(&dir);

        let preloaded = store();
        engine(config(&dir), &preloaded).run_ingestion().await.unwrap();

        let per_point = store();
        let config = PipelineConfig {
            preload_geometry: false,
            ..config(&dir)
        };
        engine(config, &per_point).run_ingestion().await.unwrap();

        assert_eq!(preloaded.live_detections(), per_point.live_detections());
        assert_eq!(preloaded.links(), per_point.links());
    }

    #[tokio::test]
    async fn test_summary_serializes() {
        let dir = tempdir().unwrap();
        seed_feeds(&dir);
        let store = store();

        let summary = engine(config(&dir), &store).run_cycle().await.unwrap();
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["ingestion"]["added"], 3);
        assert_eq!(json["archival"]["status"], "completed");
        assert_eq!(json["archival"]["purged"], 1);
    }
}
