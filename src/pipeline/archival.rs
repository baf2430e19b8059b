//! Archival engine: live -> candidate -> archived -> purged
//!
//! One pass:
//! 1. cutoff = latest live acquisition - retention window (no live rows: no-op)
//! 2. candidates = live detections acquired strictly before the cutoff
//! 3. archive each candidate (a natural-key conflict resolves to the existing
//!    archive row)
//! 4. migrate each candidate's forestry links under its archived id
//! 5. purge the candidates' links and live rows in bulk
//!
//! Everything runs in one `ArchivalSession`. Any failure drops the session,
//! which rolls back the pass, so step 5 can never run for a candidate whose
//! steps 3-4 did not complete. Steps 3-4 tolerate rows left by an earlier
//! pass, so retrying the whole pass converges.

use super::db::{ArchiveWrite, PersistenceGateway};
use super::error::{ArchivalFailure, ArchivalStep, StoreError};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::Serialize;

/// Counters for one completed archival pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ArchivalReport {
    pub cutoff: Option<NaiveDateTime>,
    pub candidates: usize,
    /// New archive rows written
    pub archived: usize,
    /// Candidates that resolved to an archive row from an earlier pass
    pub already_archived: usize,
    pub links_migrated: usize,
    /// Live rows removed
    pub purged: usize,
}

pub struct ArchivalEngine {
    retention: Duration,
}

impl ArchivalEngine {
    pub fn new(retention: Duration) -> Self {
        Self { retention }
    }

    pub async fn run(
        &self,
        gateway: &dyn PersistenceGateway,
        archived_at: DateTime<Utc>,
    ) -> Result<ArchivalReport, ArchivalFailure> {
        let mut session = gateway
            .begin_archival()
            .await
            .map_err(at(ArchivalStep::Begin))?;

        let Some(latest) = session
            .latest_acquisition()
            .await
            .map_err(at(ArchivalStep::Cutoff))?
        else {
            log::info!("Live store empty, nothing to archive");
            return Ok(ArchivalReport::default());
        };

        let cutoff = latest.checked_sub_signed(self.retention).ok_or_else(|| ArchivalFailure {
            step: ArchivalStep::Cutoff,
            source: StoreError::OutOfRange(format!(
                "latest acquisition {} minus retention {}",
                latest, self.retention
            )),
        })?;
        log::info!("Cutoff time for archiving: {} (latest live: {})", cutoff, latest);

        let candidates = session
            .select_candidates(cutoff)
            .await
            .map_err(at(ArchivalStep::SelectCandidates))?;
        log::info!("Points to archive: {}", candidates.len());

        let mut report = ArchivalReport {
            cutoff: Some(cutoff),
            candidates: candidates.len(),
            ..ArchivalReport::default()
        };
        if candidates.is_empty() {
            return Ok(report);
        }

        let mut resolved = Vec::with_capacity(candidates.len());
        for id in &candidates {
            let write = session
                .archive_detection(*id, archived_at)
                .await
                .map_err(at(ArchivalStep::ArchiveDetection))?;
            match write {
                ArchiveWrite::Inserted(_) => report.archived += 1,
                ArchiveWrite::Existing(existing) => {
                    log::debug!("Detection {} already archived as {}", id, existing);
                    report.already_archived += 1;
                }
            }
            resolved.push((*id, write.id()));
        }

        for (live_id, archived_id) in &resolved {
            report.links_migrated += session
                .migrate_links(*live_id, *archived_id)
                .await
                .map_err(at(ArchivalStep::MigrateLinks))?;
        }

        report.purged = session
            .purge(&candidates)
            .await
            .map_err(at(ArchivalStep::Purge))?;

        session.commit().await.map_err(at(ArchivalStep::Commit))?;

        log::info!(
            "📦 Archived {} points older than {} ({} new, {} already archived, {} links moved)",
            report.purged,
            cutoff,
            report.archived,
            report.already_archived,
            report.links_migrated
        );

        Ok(report)
    }
}

fn at(step: ArchivalStep) -> impl Fn(StoreError) -> ArchivalFailure {
    move |source| ArchivalFailure { step, source }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::memory_store::{FailPoint, MemoryGateway};
    use crate::pipeline::test_support::detection;
    use crate::pipeline::types::ParcelId;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 2, 6, 0, 0).unwrap()
    }

    fn engine() -> ArchivalEngine {
        ArchivalEngine::new(Duration::hours(24))
    }

    /// max live = 2024-05-02T01:00, cutoff = 2024-05-01T01:00
    fn seeded() -> MemoryGateway {
        let store = MemoryGateway::new();
        store.seed_live(
            detection("51.1", "71.4", "2024-05-01", "0000", &["A", "B"]),
            &[ParcelId(1), ParcelId(2)],
        );
        store.seed_live(detection("51.2", "71.5", "2024-05-01", "0200", &["A"]), &[ParcelId(1)]);
        store.seed_live(detection("51.3", "71.6", "2024-05-02", "0100", &["B"]), &[]);
        store
    }

    #[tokio::test]
    async fn test_detection_before_cutoff_is_migrated() {
        let store = seeded();
        let report = engine().run(&store, now()).await.unwrap();

        assert_eq!(
            report.cutoff.unwrap().to_string(),
            "2024-05-01 01:00:00"
        );
        assert_eq!(report.candidates, 1);
        assert_eq!(report.archived, 1);
        assert_eq!(report.links_migrated, 2);
        assert_eq!(report.purged, 1);

        let live_times: Vec<String> = store
            .live_detections()
            .iter()
            .map(|(_, d)| d.fire.key.acquired_at().to_string())
            .collect();
        assert_eq!(live_times, vec!["2024-05-01 02:00:00", "2024-05-02 01:00:00"]);

        let archived = store.archived_detections();
        assert_eq!(archived.len(), 1);
        let (archived_id, record) = &archived[0];
        assert_eq!(record.detection.fire.key.latitude.to_string(), "51.1");
        assert_eq!(record.detection.provenance.len(), 2);
        assert_eq!(record.archived_at, now());
        assert_eq!(
            store.archived_links(),
            vec![(*archived_id, ParcelId(1)), (*archived_id, ParcelId(2))]
        );

        // Only the surviving detection's link remains live
        assert_eq!(store.links().len(), 1);
    }

    #[tokio::test]
    async fn test_cutoff_is_strict() {
        let store = MemoryGateway::new();
        store.seed_live(detection("51.1", "71.4", "2024-05-01", "0100", &["A"]), &[]);
        store.seed_live(detection("51.3", "71.6", "2024-05-02", "0100", &["B"]), &[]);

        let report = engine().run(&store, now()).await.unwrap();
        assert_eq!(report.candidates, 0);
        assert_eq!(store.live_detections().len(), 2);
    }

    #[tokio::test]
    async fn test_second_pass_changes_nothing() {
        let store = seeded();
        engine().run(&store, now()).await.unwrap();
        let live = store.live_detections();
        let archived = store.archived_detections();
        let archived_links = store.archived_links();

        let second = engine().run(&store, now()).await.unwrap();
        assert_eq!(second.candidates, 0);
        assert_eq!(store.live_detections(), live);
        assert_eq!(store.archived_detections(), archived);
        assert_eq!(store.archived_links(), archived_links);
    }

    #[tokio::test]
    async fn test_empty_store_is_noop() {
        let store = MemoryGateway::new();
        let report = engine().run(&store, now()).await.unwrap();
        assert_eq!(report, ArchivalReport::default());
    }

    #[tokio::test]
    async fn test_existing_archive_row_is_reused() {
        let store = seeded();
        engine().run(&store, now()).await.unwrap();

        // The same key shows up live again (e.g. an old file re-ingested)
        store.seed_live(
            detection("51.1", "71.4", "2024-05-01", "0000", &["A"]),
            &[ParcelId(2), ParcelId(3)],
        );
        let report = engine().run(&store, now()).await.unwrap();

        assert_eq!(report.candidates, 1);
        assert_eq!(report.archived, 0);
        assert_eq!(report.already_archived, 1);
        // (archived, 2) existed already; only parcel 3 is new
        assert_eq!(report.links_migrated, 1);
        assert_eq!(store.archived_detections().len(), 1);
        assert_eq!(store.archived_links().len(), 3);
        assert_eq!(store.live_detections().len(), 2);
    }

    #[tokio::test]
    async fn test_failure_rolls_back_whole_pass() {
        for point in [FailPoint::ArchiveDetection, FailPoint::MigrateLinks, FailPoint::Purge, FailPoint::Commit] {
            let store = seeded();
            store.fail(point);

            let err = engine().run(&store, now()).await.unwrap_err();
            assert!(matches!(err.source, StoreError::Unavailable(_)));

            assert_eq!(store.live_detections().len(), 3, "{:?}", point);
            assert_eq!(store.links().len(), 3, "{:?}", point);
            assert!(store.archived_detections().is_empty(), "{:?}", point);
            assert!(store.archived_links().is_empty(), "{:?}", point);

            // Retrying after the fault clears converges to the normal end state
            store.clear_failures();
            let report = engine().run(&store, now()).await.unwrap();
            assert_eq!(report.purged, 1);
            assert_eq!(store.archived_detections().len(), 1);
        }
    }

    #[tokio::test]
    async fn test_retention_beyond_calendar_fails_cutoff() {
        let store = seeded();
        let engine = ArchivalEngine::new(Duration::try_hours(3_000_000_000).unwrap());

        let err = engine.run(&store, now()).await.unwrap_err();
        assert_eq!(err.step, ArchivalStep::Cutoff);
        assert!(matches!(err.source, StoreError::OutOfRange(_)));
        assert_eq!(store.live_detections().len(), 3);
        assert!(store.archived_detections().is_empty());
    }

    #[tokio::test]
    async fn test_failure_reports_step() {
        let store = seeded();
        store.fail(FailPoint::MigrateLinks);
        let err = engine().run(&store, now()).await.unwrap_err();
        assert_eq!(err.step, ArchivalStep::MigrateLinks);
    }
}
