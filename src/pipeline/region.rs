//! Region filter: only candidates inside the configured boundary proceed

use super::error::SpatialQueryError;
use super::spatial::SpatialLookup;
use super::types::DetectionKey;
use std::sync::Arc;

pub struct RegionFilter {
    spatial: Arc<dyn SpatialLookup>,
}

impl RegionFilter {
    pub fn new(spatial: Arc<dyn SpatialLookup>) -> Self {
        Self { spatial }
    }

    pub async fn contains(&self, key: &DetectionKey) -> Result<bool, SpatialQueryError> {
        self.spatial.region_contains(key.point()).await
    }
}
