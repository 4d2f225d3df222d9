use serde::{Deserialize, Serialize};

/// Mean earth radius used by the local planar projection.
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub const fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn is_finite(&self) -> bool {
        self.lat.is_finite() && self.lon.is_finite()
    }
}

/// Planar meters east (`x`) and north (`y`) of the projection origin.
#[derive(Debug, Copy, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LocalPoint {
    pub x: f64,
    pub y: f64,
}

impl LocalPoint {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance_to(self, other: LocalPoint) -> f64 {
        (other.x - self.x).hypot(other.y - self.y)
    }
}

/// Viewport rectangle in geographic degrees.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoBounds {
    pub south: f64,
    pub west: f64,
    pub north: f64,
    pub east: f64,
}

impl GeoBounds {
    pub fn is_valid(&self) -> bool {
        [self.south, self.west, self.north, self.east]
            .iter()
            .all(|value| value.is_finite())
            && self.south <= self.north
            && self.west <= self.east
    }
}

/// Equirectangular projection around a fixed origin.
///
/// Accurate to well under a pixel across a field-sized area; the scale factor
/// is taken once at the origin latitude and never updated.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct LocalProjection {
    origin: GeoPoint,
    meters_per_deg_lat: f64,
    meters_per_deg_lon: f64,
}

impl LocalProjection {
    pub fn new(origin: GeoPoint) -> Self {
        let meters_per_deg_lat = EARTH_RADIUS_M * std::f64::consts::PI / 180.0;
        Self {
            origin,
            meters_per_deg_lat,
            meters_per_deg_lon: meters_per_deg_lat * origin.lat.to_radians().cos(),
        }
    }

    pub fn origin(&self) -> GeoPoint {
        self.origin
    }

    pub fn project(&self, point: GeoPoint) -> LocalPoint {
        LocalPoint {
            x: (point.lon - self.origin.lon) * self.meters_per_deg_lon,
            y: (point.lat - self.origin.lat) * self.meters_per_deg_lat,
        }
    }

    pub fn unproject(&self, point: LocalPoint) -> GeoPoint {
        GeoPoint {
            lat: self.origin.lat + point.y / self.meters_per_deg_lat,
            lon: self.origin.lon + point.x / self.meters_per_deg_lon,
        }
    }

    /// Projects both corners, returning `(min, max)` in local meters.
    pub fn project_bounds(&self, bounds: GeoBounds) -> (LocalPoint, LocalPoint) {
        let south_west = self.project(GeoPoint::new(bounds.south, bounds.west));
        let north_east = self.project(GeoPoint::new(bounds.north, bounds.east));
        (
            LocalPoint::new(south_west.x.min(north_east.x), south_west.y.min(north_east.y)),
            LocalPoint::new(south_west.x.max(north_east.x), south_west.y.max(north_east.y)),
        )
    }
}
