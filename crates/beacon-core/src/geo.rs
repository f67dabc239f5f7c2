//! Great-circle distance and coordinate validation.
//!
//! All proximity decisions go through [`distance_km`]. [`bounding_box`] is a
//! cheap pre-filter only; membership is always re-checked with the exact
//! distance.

use serde::{Deserialize, Serialize};

use crate::errors::CoreError;

/// Mean Earth radius in kilometres.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Kilometres per degree of latitude.
const KM_PER_DEGREE_LAT: f64 = 111.32;

/// Widening applied to the pre-filter radius. 111.32 overstates a degree on
/// the 6371 km sphere by about 0.1%, so an unpadded box clips the boundary.
const BOX_MARGIN: f64 = 1.01;

/// A validated WGS84 position. Immutable once constructed.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCoordinate")]
pub struct Coordinate {
    lat: f64,
    lng: f64,
}

#[derive(Deserialize)]
struct RawCoordinate {
    lat: f64,
    lng: f64,
}

impl TryFrom<RawCoordinate> for Coordinate {
    type Error = CoreError;

    fn try_from(raw: RawCoordinate) -> Result<Self, Self::Error> {
        Self::new(raw.lat, raw.lng)
    }
}

impl Coordinate {
    /// Validate and build a coordinate. NaN is rejected along with
    /// out-of-range degrees.
    pub fn new(lat: f64, lng: f64) -> Result<Self, CoreError> {
        if !(-90.0..=90.0).contains(&lat) {
            return Err(CoreError::LatitudeOutOfRange(lat));
        }
        if !(-180.0..=180.0).contains(&lng) {
            return Err(CoreError::LongitudeOutOfRange(lng));
        }
        Ok(Self { lat, lng })
    }

    /// Build from the optional `lat`/`lng` pair carried by frames.
    ///
    /// Both absent is `Ok(None)`; exactly one present is an error.
    pub fn from_parts(lat: Option<f64>, lng: Option<f64>) -> Result<Option<Self>, CoreError> {
        match (lat, lng) {
            (Some(lat), Some(lng)) => Self::new(lat, lng).map(Some),
            (None, None) => Ok(None),
            _ => Err(CoreError::PartialCoordinate),
        }
    }

    pub fn lat(&self) -> f64 {
        self.lat
    }

    pub fn lng(&self) -> f64 {
        self.lng
    }
}

/// Haversine distance between two coordinates in kilometres.
///
/// Symmetric, non-negative, zero for identical inputs.
pub fn distance_km(a: Coordinate, b: Coordinate) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();

    let half_lat = (d_lat / 2.0).sin();
    let half_lng = (d_lng / 2.0).sin();
    let x = half_lat * half_lat + lat1.cos() * lat2.cos() * half_lng * half_lng;
    // Rounding can push x a hair past 1.0 for antipodal points.
    let x = x.clamp(0.0, 1.0);

    2.0 * x.sqrt().atan2((1.0 - x).sqrt()) * EARTH_RADIUS_KM
}

/// Axis-aligned degree box around a centre point.
///
/// Longitudes may fall outside [-180, 180] when the box crosses the
/// antimeridian; [`BoundingBox::contains`] accounts for the wrap.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl BoundingBox {
    pub fn contains(&self, point: Coordinate) -> bool {
        if point.lat < self.min_lat || point.lat > self.max_lat {
            return false;
        }
        [point.lng, point.lng + 360.0, point.lng - 360.0]
            .iter()
            .any(|lng| *lng >= self.min_lng && *lng <= self.max_lng)
    }
}

/// Pre-filter box for a radius search.
///
/// Latitude delta is `radius / 111.32`; the longitude delta is widened by
/// `1 / cos(lat)` taken at the box's poleward edge and saturates to the whole
/// globe near the poles. The box never excludes a point within the radius.
pub fn bounding_box(center: Coordinate, radius_km: f64) -> BoundingBox {
    let radius_km = radius_km.max(0.0) * BOX_MARGIN;
    let d_lat = radius_km / KM_PER_DEGREE_LAT;
    let min_lat = (center.lat - d_lat).max(-90.0);
    let max_lat = (center.lat + d_lat).min(90.0);

    let cos_lat = min_lat.abs().max(max_lat.abs()).to_radians().cos();
    let d_lng = if cos_lat <= f64::EPSILON {
        180.0
    } else {
        (radius_km / (KM_PER_DEGREE_LAT * cos_lat)).min(180.0)
    };

    // A box touching a pole covers every longitude.
    if min_lat <= -90.0 || max_lat >= 90.0 || d_lng >= 180.0 {
        return BoundingBox {
            min_lat,
            max_lat,
            min_lng: -180.0,
            max_lng: 180.0,
        };
    }
    BoundingBox {
        min_lat,
        max_lat,
        min_lng: center.lng - d_lng,
        max_lng: center.lng + d_lng,
    }
}
