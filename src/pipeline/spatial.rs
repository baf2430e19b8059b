//! Spatial lookups behind the region filter and forestry associator
//!
//! `SpatialIndex` preloads every region boundary and forestry parcel once per
//! run and answers containment in memory (bbox prefilter, then exact test).
//! `StoreSpatialLookup` forwards every query to the gateway, one round trip
//! per point.

use super::db::PersistenceGateway;
use super::error::{SpatialQueryError, StoreError};
use super::geometry::MultiPolygon;
use super::types::{GeoPoint, ParcelId};
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait SpatialLookup: Send + Sync {
    async fn region_contains(&self, point: GeoPoint) -> Result<bool, SpatialQueryError>;

    async fn parcels_containing(&self, point: GeoPoint) -> Result<Vec<ParcelId>, SpatialQueryError>;
}

/// In-memory geometry for one run
pub struct SpatialIndex {
    regions: Vec<MultiPolygon>,
    parcels: Vec<(ParcelId, MultiPolygon)>,
}

impl SpatialIndex {
    pub fn new(regions: Vec<MultiPolygon>, parcels: Vec<(ParcelId, MultiPolygon)>) -> Self {
        Self { regions, parcels }
    }

    pub async fn preload(gateway: &dyn PersistenceGateway) -> Result<Self, StoreError> {
        let regions = gateway.load_region_boundaries().await?;
        let parcels = gateway.load_forestry_parcels().await?;

        if regions.is_empty() {
            log::warn!("⚠️  No region boundary loaded: every candidate will be out of region");
        }
        log::info!(
            "🗺️  Geometry preloaded: {} region boundaries, {} forestry parcels",
            regions.len(),
            parcels.len()
        );

        Ok(Self::new(regions, parcels))
    }
}

#[async_trait]
impl SpatialLookup for SpatialIndex {
    async fn region_contains(&self, point: GeoPoint) -> Result<bool, SpatialQueryError> {
        Ok(self.regions.iter().any(|region| region.contains(point)))
    }

    async fn parcels_containing(&self, point: GeoPoint) -> Result<Vec<ParcelId>, SpatialQueryError> {
        Ok(self
            .parcels
            .iter()
            .filter(|(_, geometry)| geometry.contains(point))
            .map(|(id, _)| *id)
            .collect())
    }
}

/// Per-point lookups against the store
pub struct StoreSpatialLookup {
    gateway: Arc<dyn PersistenceGateway>,
}

impl StoreSpatialLookup {
    pub fn new(gateway: Arc<dyn PersistenceGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl SpatialLookup for StoreSpatialLookup {
    async fn region_contains(&self, point: GeoPoint) -> Result<bool, SpatialQueryError> {
        Ok(self.gateway.region_contains(point).await?)
    }

    async fn parcels_containing(&self, point: GeoPoint) -> Result<Vec<ParcelId>, SpatialQueryError> {
        Ok(self.gateway.parcels_containing(point).await?)
    }
}
