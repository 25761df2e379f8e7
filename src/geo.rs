//! Great-circle geometry.
//!
//! Haversine distance on a spherical Earth plus the `lat,lon,km` radius
//! value accepted on the command line.

use std::f64::consts::PI;

/// Earth radius in kilometers for haversine calculations.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Calculate the great-circle distance between two points using the haversine formula.
///
/// Returns distance in kilometers. NaN inputs propagate NaN; callers validate
/// coordinates before they get here.
#[must_use]
pub fn distance_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1_rad = lat1 * PI / 180.0;
    let lat2_rad = lat2 * PI / 180.0;
    let delta_lat = (lat2 - lat1) * PI / 180.0;
    let delta_lon = (lon2 - lon1) * PI / 180.0;

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    // Rounding can push `a` a hair above 1.0 for antipodal points.
    let c = 2.0 * a.clamp(0.0, 1.0).sqrt().asin();

    EARTH_RADIUS_KM * c
}

/// Check that a coordinate pair lies in the valid ±90 / ±180 ranges.
#[must_use]
pub fn valid_coordinates(lat: f64, lon: f64) -> bool {
    lat.is_finite() && lon.is_finite() && (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon)
}

/// Radius filter for geographic filtering.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RadiusFilter {
    pub center_lat: f64,
    pub center_lon: f64,
    pub radius_km: f64,
}

impl std::str::FromStr for RadiusFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').collect();
        if parts.len() != 3 {
            return Err(format!(
                "radius requires 3 values (lat,lon,radius_km), got {}",
                parts.len()
            ));
        }

        let vals: Result<Vec<f64>, _> = parts.iter().map(|p| p.trim().parse::<f64>()).collect();
        let vals = vals.map_err(|e| format!("invalid number in radius: {e}"))?;

        let filter = Self {
            center_lat: vals[0],
            center_lon: vals[1],
            radius_km: vals[2],
        };

        if !valid_coordinates(filter.center_lat, filter.center_lon) {
            return Err(format!(
                "center {},{} out of range [-90, 90] / [-180, 180]",
                filter.center_lat, filter.center_lon
            ));
        }
        if filter.radius_km <= 0.0 || !filter.radius_km.is_finite() {
            return Err(format!("radius must be positive, got {}", filter.radius_km));
        }

        Ok(filter)
    }
}

impl RadiusFilter {
    /// Check if a point is within the radius.
    #[must_use]
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        distance_km(self.center_lat, self.center_lon, lat, lon) <= self.radius_km
    }
}
