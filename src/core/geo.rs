use crate::constants::{DEFAULT_CIRCLE_STEPS, KM_PER_MILE, MAX_LATITUDE};
use crate::{Error, Result};
use geo::{HaversineDestination, HaversineDistance};
use geo_types::{Coord, LineString, Point, Polygon};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// A geographic position in degrees, longitude first.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LngLat {
    pub lng: f64,
    pub lat: f64,
}

impl LngLat {
    /// Creates a new LngLat coordinate
    pub fn new(lng: f64, lat: f64) -> Self {
        Self { lng, lat }
    }

    /// Validates that the coordinates are within valid ranges
    pub fn is_valid(&self) -> bool {
        self.lat >= -90.0 && self.lat <= 90.0 && self.lng.is_finite()
    }

    /// Great-circle distance to another position, in the requested units.
    pub fn distance_to(&self, other: &LngLat, units: Units) -> f64 {
        let meters = self.to_point().haversine_distance(&other.to_point());
        units.from_kilometers(meters / 1000.0)
    }

    /// Position reached by travelling `distance` along `bearing` (degrees from north).
    pub fn destination(&self, bearing: f64, distance: f64, units: Units) -> LngLat {
        let meters = units.to_kilometers(distance) * 1000.0;
        LngLat::from(self.to_point().haversine_destination(bearing, meters))
    }

    /// Wraps longitude to [-180, 180] range
    pub fn wrap_lng(lng: f64) -> f64 {
        let wrapped = (lng + 180.0).rem_euclid(360.0) - 180.0;
        if wrapped == -180.0 && lng > 0.0 {
            180.0
        } else {
            wrapped
        }
    }

    /// Clamps latitude to the Web-Mercator range
    pub fn clamp_lat(lat: f64) -> f64 {
        lat.clamp(-MAX_LATITUDE, MAX_LATITUDE)
    }

    pub fn to_point(&self) -> Point<f64> {
        Point::new(self.lng, self.lat)
    }
}

impl Default for LngLat {
    fn default() -> Self {
        Self::new(0.0, 0.0)
    }
}

impl From<Point<f64>> for LngLat {
    fn from(point: Point<f64>) -> Self {
        Self::new(point.x(), point.y())
    }
}

impl From<Coord<f64>> for LngLat {
    fn from(coord: Coord<f64>) -> Self {
        Self::new(coord.x, coord.y)
    }
}

/// Distance units accepted by region queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Units {
    Kilometers,
    Miles,
}

impl Units {
    pub fn to_kilometers(self, value: f64) -> f64 {
        match self {
            Units::Kilometers => value,
            Units::Miles => value * KM_PER_MILE,
        }
    }

    pub fn from_kilometers(self, km: f64) -> f64 {
        match self {
            Units::Kilometers => km,
            Units::Miles => km / KM_PER_MILE,
        }
    }
}

impl FromStr for Units {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "kilometers" => Ok(Units::Kilometers),
            "miles" => Ok(Units::Miles),
            other => Err(Error::Config(format!(
                "unsupported units '{}', expected 'kilometers' or 'miles'",
                other
            ))),
        }
    }
}

/// A circular query region. The polygon approximates the circle and is used to
/// find the tiles a query touches; membership of individual pixels is decided
/// by distance to `center`.
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    pub center: LngLat,
    pub radius: f64,
    pub units: Units,
    pub polygon: Polygon<f64>,
}

impl Region {
    /// Builds a region from an existing boundary polygon.
    pub fn new(center: LngLat, radius: f64, units: Units, polygon: Polygon<f64>) -> Result<Self> {
        if !(radius.is_finite() && radius >= 0.0) {
            return Err(Error::Config(format!("invalid region radius {}", radius)));
        }
        if !center.is_valid() {
            return Err(Error::Config(format!("invalid region center {:?}", center)));
        }
        Ok(Self {
            center,
            radius,
            units,
            polygon,
        })
    }

    /// Builds a region whose boundary is a `steps`-vertex circle around `center`.
    pub fn circle(center: LngLat, radius: f64, units: Units, steps: usize) -> Result<Self> {
        let steps = if steps < 3 { DEFAULT_CIRCLE_STEPS } else { steps };
        let mut ring: Vec<Coord<f64>> = (0..steps)
            .map(|i| {
                let bearing = -360.0 * i as f64 / steps as f64;
                let p = center.destination(bearing, radius, units);
                Coord { x: p.lng, y: p.lat }
            })
            .collect();
        if let Some(first) = ring.first().copied() {
            ring.push(first);
        }
        Self::new(center, radius, units, Polygon::new(LineString::from(ring), vec![]))
    }

    /// Vertices of the exterior ring.
    pub fn boundary(&self) -> impl Iterator<Item = LngLat> + '_ {
        self.polygon.exterior().coords().map(|c| LngLat::from(*c))
    }

    /// Whether a position falls within `radius` of the center.
    pub fn contains(&self, point: &LngLat) -> bool {
        self.center.distance_to(point, self.units) <= self.radius
    }
}
