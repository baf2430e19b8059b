//! Forestry associator
//!
//! Resolves the parcels overlapping a newly created detection. The links are
//! written by the gateway in the same transaction as the detection itself,
//! so association runs once per creation and never on a provenance merge.

use super::error::SpatialQueryError;
use super::spatial::SpatialLookup;
use super::types::{DetectionKey, ParcelId};
use std::sync::Arc;

pub struct ForestryAssociator {
    spatial: Arc<dyn SpatialLookup>,
}

impl ForestryAssociator {
    pub fn new(spatial: Arc<dyn SpatialLookup>) -> Self {
        Self { spatial }
    }

    /// Parcels whose polygon contains the detection point. Empty is not an error.
    pub async fn parcels_for(&self, key: &DetectionKey) -> Result<Vec<ParcelId>, SpatialQueryError> {
        let mut parcels = self.spatial.parcels_containing(key.point()).await?;
        parcels.sort();
        parcels.dedup();
        Ok(parcels)
    }
}
