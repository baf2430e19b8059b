//! Record reconciler: new detection or provenance merge
//!
//! Identity is the exact (latitude, longitude, acq_date, acq_time) key.
//! - No live match: create the detection with provenance `{source}` and its
//!   forestry links -> `Added`
//! - Match without this source: add the source -> `Updated`
//! - Match already listing this source -> `Unchanged` (no write)
//!
//! Each candidate is its own write unit. A failure never touches other
//! candidates' committed rows.

use super::db::PersistenceGateway;
use super::error::{ReconciliationWriteError, SpatialQueryError, StoreError};
use super::forestry::ForestryAssociator;
use super::types::{
    CoordinateTolerance, DetectionId, FireCandidate, NewDetection, Provenance, SatelliteId,
};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Added { id: DetectionId, links: usize },
    Updated { id: DetectionId },
    Unchanged { id: DetectionId },
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Spatial(#[from] SpatialQueryError),
    #[error(transparent)]
    Write(#[from] ReconciliationWriteError),
}

pub struct RecordReconciler {
    gateway: Arc<dyn PersistenceGateway>,
    associator: ForestryAssociator,
    tolerance: CoordinateTolerance,
}

impl RecordReconciler {
    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        associator: ForestryAssociator,
        tolerance: CoordinateTolerance,
    ) -> Self {
        Self {
            gateway,
            associator,
            tolerance,
        }
    }

    pub async fn reconcile(
        &self,
        fire: &FireCandidate,
        source: &SatelliteId,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let existing = self
            .gateway
            .find_live_detection(&fire.key, self.tolerance)
            .await
            .map_err(|cause| self.write_error(fire, source, cause))?;

        match existing {
            Some(live) => {
                if live.provenance.contains(source) {
                    return Ok(ReconcileOutcome::Unchanged { id: live.id });
                }

                let mut provenance = live.provenance;
                provenance.insert(source.clone());
                self.gateway
                    .update_provenance(live.id, &provenance)
                    .await
                    .map_err(|cause| self.write_error(fire, source, cause))?;

                log::debug!(
                    "Merged {} into detection {} ({} sources)",
                    source,
                    live.id,
                    provenance.len()
                );
                Ok(ReconcileOutcome::Updated { id: live.id })
            }
            None => {
                let parcels = self.associator.parcels_for(&fire.key).await?;
                let detection = NewDetection {
                    fire: fire.clone(),
                    provenance: Provenance::single(source.clone()),
                };
                let id = self
                    .gateway
                    .create_detection(&detection, &parcels)
                    .await
                    .map_err(|cause| self.write_error(fire, source, cause))?;

                log::debug!(
                    "Added detection {} at {} from {} ({} forestry links)",
                    id,
                    fire.key,
                    source,
                    parcels.len()
                );
                Ok(ReconcileOutcome::Added {
                    id,
                    links: parcels.len(),
                })
            }
        }
    }

    fn write_error(
        &self,
        fire: &FireCandidate,
        source: &SatelliteId,
        cause: StoreError,
    ) -> ReconciliationWriteError {
        ReconciliationWriteError {
            key: fire.key.clone(),
            source_id: source.clone(),
            cause,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::memory_store::{FailPoint, MemoryGateway};
    use crate::pipeline::spatial::StoreSpatialLookup;
    use crate::pipeline::test_support::{candidate, square};
    use crate::pipeline::types::ParcelId;

    fn reconciler(store: &MemoryGateway) -> RecordReconciler {
        let gateway: Arc<dyn PersistenceGateway> = Arc::new(store.clone());
        let spatial = Arc::new(StoreSpatialLookup::new(gateway.clone()));
        RecordReconciler::new(
            gateway,
            ForestryAssociator::new(spatial),
            CoordinateTolerance::EXACT,
        )
    }

    #[tokio::test]
    async fn test_two_sources_merge_into_one_detection() {
        let store = MemoryGateway::new();
        let rec = reconciler(&store);
        let fire = candidate("51.10", "71.40", "2024-05-01", "1230");

        let first = rec.reconcile(&fire, &SatelliteId::new("A")).await.unwrap();
        let second = rec.reconcile(&fire, &SatelliteId::new("B")).await.unwrap();

        assert!(matches!(first, ReconcileOutcome::Added { .. }));
        assert!(matches!(second, ReconcileOutcome::Updated { .. }));

        let live = store.live_detections();
        assert_eq!(live.len(), 1);
        let sources: Vec<&str> = live[0].1.provenance.iter().map(|s| s.as_str()).collect();
        assert_eq!(sources, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_arrival_order_does_not_matter() {
        let store = MemoryGateway::new();
        let rec = reconciler(&store);
        let fire = candidate("51.10", "71.40", "2024-05-01", "1230");

        for source in ["C", "A", "B", "A", "C"] {
            rec.reconcile(&fire, &SatelliteId::new(source)).await.unwrap();
        }

        let live = store.live_detections();
        assert_eq!(live.len(), 1);
        let expected: Provenance = ["A", "B", "C"].into_iter().map(SatelliteId::new).collect();
        assert_eq!(live[0].1.provenance, expected);
    }

    #[tokio::test]
    async fn test_same_source_twice_is_unchanged() {
        let store = MemoryGateway::new();
        let rec = reconciler(&store);
        let fire = candidate("51.10", "71.40", "2024-05-01", "1230");

        rec.reconcile(&fire, &SatelliteId::new("A")).await.unwrap();
        let again = rec.reconcile(&fire, &SatelliteId::new("A")).await.unwrap();
        assert!(matches!(again, ReconcileOutcome::Unchanged { .. }));
    }

    #[tokio::test]
    async fn test_trailing_zero_coordinates_match() {
        let store = MemoryGateway::new();
        let rec = reconciler(&store);

        rec.reconcile(&candidate("51.10", "71.40", "2024-05-01", "1230"), &SatelliteId::new("A"))
            .await
            .unwrap();
        let outcome = rec
            .reconcile(&candidate("51.1", "71.4", "2024-05-01", "1230"), &SatelliteId::new("B"))
            .await
            .unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Updated { .. }));
    }

    #[tokio::test]
    async fn test_new_detection_links_every_overlapping_parcel() {
        let store = MemoryGateway::new();
        store.add_parcel(ParcelId(1), square(71.0, 51.0, 1.0));
        store.add_parcel(ParcelId(2), square(71.3, 51.0, 0.5));
        store.add_parcel(ParcelId(3), square(10.0, 10.0, 1.0));
        let rec = reconciler(&store);

        let outcome = rec
            .reconcile(&candidate("51.10", "71.40", "2024-05-01", "1230"), &SatelliteId::new("A"))
            .await
            .unwrap();
        let ReconcileOutcome::Added { id, links } = outcome else {
            panic!("expected Added, got {:?}", outcome);
        };
        assert_eq!(links, 2);
        assert_eq!(store.links(), vec![(id, ParcelId(1)), (id, ParcelId(2))]);

        // A merge never re-associates
        rec.reconcile(&candidate("51.10", "71.40", "2024-05-01", "1230"), &SatelliteId::new("B"))
            .await
            .unwrap();
        assert_eq!(store.links().len(), 2);
    }

    #[tokio::test]
    async fn test_no_overlap_yields_no_links() {
        let store = MemoryGateway::new();
        store.add_parcel(ParcelId(3), square(10.0, 10.0, 1.0));
        let rec = reconciler(&store);

        let outcome = rec
            .reconcile(&candidate("51.10", "71.40", "2024-05-01", "1230"), &SatelliteId::new("A"))
            .await
            .unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Added { links: 0, .. }));
        assert!(store.links().is_empty());
    }

    #[tokio::test]
    async fn test_spatial_failure_persists_nothing() {
        let store = MemoryGateway::new();
        store.fail(FailPoint::SpatialQuery);
        let rec = reconciler(&store);

        let err = rec
            .reconcile(&candidate("51.10", "71.40", "2024-05-01", "1230"), &SatelliteId::new("A"))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Spatial(_)));
        assert!(store.live_detections().is_empty());
    }

    #[tokio::test]
    async fn test_update_failure_leaves_provenance_untouched() {
        let store = MemoryGateway::new();
        let rec = reconciler(&store);
        let fire = candidate("51.10", "71.40", "2024-05-01", "1230");
        rec.reconcile(&fire, &SatelliteId::new("A")).await.unwrap();

        store.fail(FailPoint::UpdateProvenance);
        let err = rec.reconcile(&fire, &SatelliteId::new("B")).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Write(_)));
        assert_eq!(store.live_detections()[0].1.provenance.len(), 1);
    }

    #[tokio::test]
    async fn test_tolerance_merges_nearby_coordinates() {
        let store = MemoryGateway::new();
        let gateway: Arc<dyn PersistenceGateway> = Arc::new(store.clone());
        let spatial = Arc::new(StoreSpatialLookup::new(gateway.clone()));
        let rec = RecordReconciler::new(
            gateway,
            ForestryAssociator::new(spatial),
            CoordinateTolerance("0.001".parse().unwrap()),
        );

        rec.reconcile(&candidate("51.1000", "71.4000", "2024-05-01", "1230"), &SatelliteId::new("A"))
            .await
            .unwrap();
        let outcome = rec
            .reconcile(&candidate("51.1004", "71.3997", "2024-05-01", "1230"), &SatelliteId::new("B"))
            .await
            .unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Updated { .. }));
        assert_eq!(store.live_detections().len(), 1);
    }
}
