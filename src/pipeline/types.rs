//! Core domain types for the fire-detection pipeline

use super::decimal::FixedDecimal;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Live detection row id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DetectionId(pub i64);

/// Archived detection row id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArchivedDetectionId(pub i64);

/// Forestry parcel id (read-only reference data)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParcelId(pub i64);

impl fmt::Display for DetectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ArchivedDetectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Satellite source identifier (the feed subdirectory name, e.g. `MODIS_C6`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SatelliteId(String);

impl SatelliteId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SatelliteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// WGS84 point in degrees, used only for containment tests
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub lon: f64,
    pub lat: f64,
}

impl GeoPoint {
    pub fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }

    /// WKT form stored alongside each detection row
    pub fn to_wkt(&self) -> String {
        format!("POINT({} {})", self.lon, self.lat)
    }
}

/// Spatiotemporal identity of a detection
///
/// Equality is exact decimal equality on the coordinates as published by
/// the feed. Two satellites that report the same physical event with
/// coordinates differing in the last decimal place produce two different
/// keys; see `CoordinateTolerance` for the lookup-side knob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DetectionKey {
    pub latitude: FixedDecimal,
    pub longitude: FixedDecimal,
    pub acq_date: NaiveDate,
    pub acq_time: NaiveTime,
}

impl DetectionKey {
    pub fn new(
        latitude: FixedDecimal,
        longitude: FixedDecimal,
        acq_date: NaiveDate,
        acq_time: NaiveTime,
    ) -> Self {
        Self {
            latitude,
            longitude,
            acq_date,
            acq_time,
        }
    }

    pub fn acquired_at(&self) -> NaiveDateTime {
        self.acq_date.and_time(self.acq_time)
    }

    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.longitude.to_f64(), self.latitude.to_f64())
    }
}

impl fmt::Display for DetectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}) @ {} {}",
            self.latitude,
            self.longitude,
            self.acq_date,
            self.acq_time.format("%H%M")
        )
    }
}

/// Maximum coordinate distance (degrees, per axis) at which an incoming
/// candidate is treated as the same detection as a live row.
///
/// Zero (the default) means exact key match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CoordinateTolerance(pub FixedDecimal);

impl CoordinateTolerance {
    pub const EXACT: CoordinateTolerance = CoordinateTolerance(FixedDecimal::ZERO);

    pub fn is_exact(&self) -> bool {
        self.0.is_zero()
    }

    pub fn matches(&self, a: &DetectionKey, b: &DetectionKey) -> bool {
        if a.acq_date != b.acq_date || a.acq_time != b.acq_time {
            return false;
        }
        if self.is_exact() {
            return a.latitude == b.latitude && a.longitude == b.longitude;
        }
        a.latitude.abs_diff(&b.latitude) <= self.0 && a.longitude.abs_diff(&b.longitude) <= self.0
    }
}

/// Set of satellite sources that reported a detection
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Provenance(BTreeSet<SatelliteId>);

impl Provenance {
    pub fn single(source: SatelliteId) -> Self {
        let mut set = BTreeSet::new();
        set.insert(source);
        Self(set)
    }

    pub fn contains(&self, source: &SatelliteId) -> bool {
        self.0.contains(source)
    }

    /// Returns true if the source was not already present
    pub fn insert(&mut self, source: SatelliteId) -> bool {
        self.0.insert(source)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SatelliteId> {
        self.0.iter()
    }

    /// Storage form: JSON array of source ids, sorted
    pub fn to_storage(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.0)
    }

    /// Accepts the JSON array form, and the legacy comma-joined form
    /// (`"MODIS_C6,NOAA_20_VIIRS_C2"`) found in older rows.
    pub fn from_storage(raw: &str) -> Result<Self, serde_json::Error> {
        let trimmed = raw.trim();
        if trimmed.starts_with('[') {
            let set: BTreeSet<SatelliteId> = serde_json::from_str(trimmed)?;
            return Ok(Self(set));
        }
        Ok(Self(
            trimmed
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(SatelliteId::new)
                .collect(),
        ))
    }
}

impl FromIterator<SatelliteId> for Provenance {
    fn from_iter<I: IntoIterator<Item = SatelliteId>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DayNight {
    Day,
    Night,
}

impl DayNight {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "D" | "d" => Some(DayNight::Day),
            "N" | "n" => Some(DayNight::Night),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DayNight::Day => "D",
            DayNight::Night => "N",
        }
    }
}

/// One parsed feed row
#[derive(Debug, Clone, PartialEq)]
pub struct FireCandidate {
    pub key: DetectionKey,
    pub brightness: FixedDecimal,
    pub scan: FixedDecimal,
    pub track: FixedDecimal,
    pub local_time: NaiveTime,
    pub confidence: String,
    pub version: String,
    pub bright_t31: Option<FixedDecimal>,
    pub frp: Option<FixedDecimal>,
    pub daynight: DayNight,
}

/// A detection about to be inserted into live storage
#[derive(Debug, Clone, PartialEq)]
pub struct NewDetection {
    pub fire: FireCandidate,
    pub provenance: Provenance,
}

/// Live row located by key lookup
#[derive(Debug, Clone, PartialEq)]
pub struct LiveMatch {
    pub id: DetectionId,
    pub key: DetectionKey,
    pub provenance: Provenance,
}
