//! WGS84 coordinates and the polygon helpers the harmonization core needs.
//!
//! Polygons are [`geo::Polygon`]s with longitude on `x` and latitude on `y`;
//! containment, bounding boxes and great-circle distances come from `geo`.

use geo::{
    Area as _, BoundingRect, Closest, ClosestPoint, Contains, Coord, HaversineDistance, LineString,
    MapCoords, Point, Rect,
};
use serde::{Deserialize, Serialize};

/// Length of one degree of latitude in meters.
pub const METERS_PER_DEGREE: f64 = 111_320.0;

/// Area polygon in decimal degrees (`x` = longitude, `y` = latitude).
pub type Polygon = geo::Polygon<f64>;

/// A WGS84 point in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Returns `true` when both components are finite and inside WGS84 bounds.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }

    /// Great-circle (haversine) distance to `other` in meters.
    pub fn distance_m(&self, other: &Coordinate) -> f64 {
        self.to_point().haversine_distance(&other.to_point())
    }

    pub fn to_point(self) -> Point<f64> {
        Point::new(self.longitude, self.latitude)
    }

    fn from_point(point: Point<f64>) -> Self {
        Self::new(point.y(), point.x())
    }
}

fn ring(points: &[Coordinate]) -> LineString<f64> {
    points
        .iter()
        .map(|c| Coord {
            x: c.longitude,
            y: c.latitude,
        })
        .collect()
}

/// Polygon from lat/lon rings. Rings may be given open or closed.
pub fn polygon(exterior: &[Coordinate], holes: &[Vec<Coordinate>]) -> Polygon {
    Polygon::new(ring(exterior), holes.iter().map(|h| ring(h)).collect())
}

/// Rectangle helper, mostly for fixtures and grid-shaped areas.
pub fn rectangle(min_lat: f64, min_lon: f64, max_lat: f64, max_lon: f64) -> Polygon {
    Rect::new(
        Coord {
            x: min_lon,
            y: min_lat,
        },
        Coord {
            x: max_lon,
            y: max_lat,
        },
    )
    .to_polygon()
}

/// Bounding box of the exterior ring, `None` for an empty polygon.
pub fn bbox(polygon: &Polygon) -> Option<Rect<f64>> {
    polygon.bounding_rect()
}

/// Explains why a polygon cannot be indexed, or `None` if it is usable.
pub fn degeneracy(polygon: &Polygon) -> Option<&'static str> {
    let all_finite = polygon
        .exterior()
        .coords()
        .chain(polygon.interiors().iter().flat_map(|h| h.coords()))
        .all(|c| c.x.is_finite() && c.y.is_finite());
    if !all_finite {
        return Some("non-finite vertex");
    }

    let mut distinct: Vec<&Coord<f64>> = Vec::new();
    for c in polygon.exterior().coords() {
        if !distinct.contains(&c) {
            distinct.push(c);
        }
    }
    if distinct.len() < 3 {
        return Some("fewer than three distinct vertices");
    }
    if polygon.unsigned_area() < f64::EPSILON {
        return Some("zero area");
    }
    None
}

/// Points inside a hole, or exactly on the boundary, are outside.
pub fn contains(polygon: &Polygon, point: &Coordinate) -> bool {
    polygon.contains(&point.to_point())
}

/// Distance in meters from `point` to the polygon, zero when inside.
///
/// The closest boundary point is found on a local equirectangular projection
/// centred on `point`; the distance to it is great-circle.
pub fn distance_m(polygon: &Polygon, point: &Coordinate) -> f64 {
    let scale = point.latitude.to_radians().cos().max(1e-6);
    let projected = polygon.map_coords(|c| Coord {
        x: c.x * scale,
        y: c.y,
    });
    let target = Point::new(point.longitude * scale, point.latitude);
    match projected.closest_point(&target) {
        Closest::Intersection(_) => 0.0,
        Closest::SinglePoint(p) => {
            let nearest = Coordinate::from_point(Point::new(p.x() / scale, p.y()));
            point.distance_m(&nearest)
        }
        Closest::Indeterminate => f64::INFINITY,
    }
}
