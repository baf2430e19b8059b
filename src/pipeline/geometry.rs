//! Polygon containment for region boundaries and forestry parcels
//!
//! Geometry is stored as GeoJSON-style multipolygon coordinates
//! (`[[[lon, lat], ...], ...]` per polygon, first ring exterior, remaining
//! rings holes). Containment matches `ST_Contains`: a point on a ring is not
//! contained, a point inside a hole is not contained.

use super::types::GeoPoint;
use serde::{Deserialize, Serialize};

/// Axis-aligned bounding box in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub fn contains(&self, p: GeoPoint) -> bool {
        p.lon >= self.min_lon && p.lon <= self.max_lon && p.lat >= self.min_lat && p.lat <= self.max_lat
    }

    fn extend(&mut self, other: &BoundingBox) {
        self.min_lon = self.min_lon.min(other.min_lon);
        self.min_lat = self.min_lat.min(other.min_lat);
        self.max_lon = self.max_lon.max(other.max_lon);
        self.max_lat = self.max_lat.max(other.max_lat);
    }
}

pub type Ring = Vec<[f64; 2]>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polygon {
    pub exterior: Ring,
    pub holes: Vec<Ring>,
}

impl Polygon {
    pub fn new(exterior: Ring) -> Self {
        Self {
            exterior,
            holes: Vec::new(),
        }
    }

    pub fn with_hole(mut self, hole: Ring) -> Self {
        self.holes.push(hole);
        self
    }

    pub fn contains(&self, p: GeoPoint) -> bool {
        match ring_position(&self.exterior, p) {
            RingPosition::Inside => {}
            RingPosition::Outside | RingPosition::Boundary => return false,
        }
        // On a hole's ring counts as the polygon boundary
        self.holes
            .iter()
            .all(|hole| ring_position(hole, p) == RingPosition::Outside)
    }

    fn bbox(&self) -> Option<BoundingBox> {
        ring_bbox(&self.exterior)
    }
}

/// Multipolygon with a precomputed bounding box
#[derive(Debug, Clone, PartialEq)]
pub struct MultiPolygon {
    polygons: Vec<Polygon>,
    bbox: BoundingBox,
}

impl MultiPolygon {
    /// Returns `None` when no polygon has a usable exterior ring (fewer than
    /// three distinct vertices or non-finite coordinates)
    pub fn new(polygons: Vec<Polygon>) -> Option<Self> {
        let polygons: Vec<Polygon> = polygons
            .into_iter()
            .filter(|poly| poly.bbox().is_some())
            .collect();

        let mut iter = polygons.iter().filter_map(Polygon::bbox);
        let mut bbox = iter.next()?;
        for b in iter {
            bbox.extend(&b);
        }

        Some(Self { polygons, bbox })
    }

    pub fn bbox(&self) -> BoundingBox {
        self.bbox
    }

    pub fn contains(&self, p: GeoPoint) -> bool {
        self.bbox.contains(p) && self.polygons.iter().any(|poly| poly.contains(p))
    }

    /// GeoJSON multipolygon coordinates
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let coords: Vec<Vec<Ring>> = self
            .polygons
            .iter()
            .map(|poly| {
                let mut rings = Vec::with_capacity(poly.holes.len() + 1);
                rings.push(poly.exterior.clone());
                rings.extend(poly.holes.iter().cloned());
                rings
            })
            .collect();
        serde_json::to_string(&coords)
    }

    /// Parses GeoJSON multipolygon coordinates; a bare polygon
    /// (`[[[lon, lat], ...]]`) is accepted as a one-element multipolygon.
    pub fn from_json(raw: &str) -> Result<Option<Self>, serde_json::Error> {
        let coords: Vec<Vec<Ring>> = match serde_json::from_str::<Vec<Vec<Ring>>>(raw) {
            Ok(multi) => multi,
            Err(_) => vec![serde_json::from_str::<Vec<Ring>>(raw)?],
        };
        let polygons = coords
            .into_iter()
            .filter_map(|mut rings| {
                if rings.is_empty() {
                    return None;
                }
                let exterior = rings.remove(0);
                Some(Polygon {
                    exterior,
                    holes: rings,
                })
            })
            .collect();
        Ok(MultiPolygon::new(polygons))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RingPosition {
    Inside,
    Outside,
    Boundary,
}

fn ring_bbox(ring: &Ring) -> Option<BoundingBox> {
    let mut distinct = ring.clone();
    distinct.dedup();
    if distinct.len() > 1 && distinct.first() == distinct.last() {
        distinct.pop();
    }
    if distinct.len() < 3 || ring.iter().any(|[x, y]| !x.is_finite() || !y.is_finite()) {
        return None;
    }

    let mut bbox = BoundingBox {
        min_lon: f64::INFINITY,
        min_lat: f64::INFINITY,
        max_lon: f64::NEG_INFINITY,
        max_lat: f64::NEG_INFINITY,
    };
    for [lon, lat] in ring {
        bbox.min_lon = bbox.min_lon.min(*lon);
        bbox.min_lat = bbox.min_lat.min(*lat);
        bbox.max_lon = bbox.max_lon.max(*lon);
        bbox.max_lat = bbox.max_lat.max(*lat);
    }
    Some(bbox)
}

/// Even-odd ray cast with an explicit on-edge check. Rings may be open or
/// closed; the closing edge is implied.
fn ring_position(ring: &Ring, p: GeoPoint) -> RingPosition {
    let n = ring.len();
    if n < 3 {
        return RingPosition::Outside;
    }

    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let [xi, yi] = ring[i];
        let [xj, yj] = ring[j];

        if on_segment(xi, yi, xj, yj, p) {
            return RingPosition::Boundary;
        }

        if (yi > p.lat) != (yj > p.lat) {
            let x_cross = (xj - xi) * (p.lat - yi) / (yj - yi) + xi;
            if p.lon < x_cross {
                inside = !inside;
            }
        }
        j = i;
    }

    if inside {
        RingPosition::Inside
    } else {
        RingPosition::Outside
    }
}

fn on_segment(x1: f64, y1: f64, x2: f64, y2: f64, p: GeoPoint) -> bool {
    let cross = (x2 - x1) * (p.lat - y1) - (y2 - y1) * (p.lon - x1);
    if cross.abs() > 1e-12 {
        return false;
    }
    p.lon >= x1.min(x2) && p.lon <= x1.max(x2) && p.lat >= y1.min(y2) && p.lat <= y1.max(y2)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(min: f64, max: f64) -> Ring {
        vec![[min, min], [max, min], [max, max], [min, max], [min, min]]
    }

    #[test]
    fn test_point_in_square() {
        let poly = Polygon::new(square(0.0, 10.0));
        assert!(poly.contains(GeoPoint::new(5.0, 5.0)));
        assert!(!poly.contains(GeoPoint::new(15.0, 5.0)));
        assert!(!poly.contains(GeoPoint::new(-0.1, 5.0)));
    }

    #[test]
    fn test_boundary_is_not_contained() {
        let poly = Polygon::new(square(0.0, 10.0));
        assert!(!poly.contains(GeoPoint::new(0.0, 5.0)));
        assert!(!poly.contains(GeoPoint::new(10.0, 10.0)));
        assert!(!poly.contains(GeoPoint::new(5.0, 0.0)));
    }

    #[test]
    fn test_hole_excludes_points() {
        let poly = Polygon::new(square(0.0, 10.0)).with_hole(square(4.0, 6.0));
        assert!(!poly.contains(GeoPoint::new(5.0, 5.0)));
        assert!(!poly.contains(GeoPoint::new(4.0, 5.0)));
        assert!(poly.contains(GeoPoint::new(2.0, 2.0)));
    }

    #[test]
    fn test_multipolygon_and_json() {
        let multi = MultiPolygon::new(vec![
            Polygon::new(square(0.0, 1.0)),
            Polygon::new(square(5.0, 6.0)),
        ])
        .unwrap();
        assert!(multi.contains(GeoPoint::new(0.5, 0.5)));
        assert!(multi.contains(GeoPoint::new(5.5, 5.5)));
        assert!(!multi.contains(GeoPoint::new(3.0, 3.0)));
        assert_eq!(multi.bbox().max_lon, 6.0);

        let parsed = MultiPolygon::from_json(&multi.to_json().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(parsed, multi);

        let bare = MultiPolygon::from_json("[[[0,0],[2,0],[2,2],[0,2]]]")
            .unwrap()
            .unwrap();
        assert!(bare.contains(GeoPoint::new(1.0, 1.0)));
    }

    #[test]
    fn test_degenerate_rings_are_rejected() {
        assert!(MultiPolygon::new(vec![Polygon::new(vec![[0.0, 0.0], [1.0, 1.0], [0.0, 0.0]])]).is_none());
        assert!(MultiPolygon::new(Vec::new()).is_none());
        assert!(MultiPolygon::from_json("not json").is_err());
    }
}
