//! Shared fixtures for unit tests

use super::feed_reader::parse_row;
use super::geometry::{MultiPolygon, Polygon};
use super::types::{FireCandidate, NewDetection, Provenance, SatelliteId};
use chrono::Duration;

/// Candidate parsed from a minimal FIRMS row
pub fn candidate(lat: &str, lon: &str, date: &str, time: &str) -> FireCandidate {
    let row = format!(
        "{},{},320.5,1.2,1.1,{},{},T,85,6.1NRT,290.1,15.3,D",
        lat, lon, date, time
    );
    let fields: Vec<&str> = row.split(',').collect();
    parse_row(&fields, Duration::hours(5)).unwrap()
}

pub fn detection(lat: &str, lon: &str, date: &str, time: &str, sources: &[&str]) -> NewDetection {
    NewDetection {
        fire: candidate(lat, lon, date, time),
        provenance: sources.iter().map(|s| SatelliteId::new(*s)).collect::<Provenance>(),
    }
}

/// Axis-aligned square in degrees
pub fn square(min_lon: f64, min_lat: f64, size: f64) -> MultiPolygon {
    MultiPolygon::new(vec![Polygon::new(vec![
        [min_lon, min_lat],
        [min_lon + size, min_lat],
        [min_lon + size, min_lat + size],
        [min_lon, min_lat + size],
    ])])
    .unwrap()
}
