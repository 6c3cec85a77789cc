//! Great-circle distance between driver and pickup coordinates.

use serde::{Deserialize, Serialize};

/// Mean Earth radius in kilometres.
pub const EARTH_RADIUS_KM: f64 = 6_371.008_8;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLon {
    pub lat_deg: f64,
    pub lon_deg: f64,
}

impl LatLon {
    pub fn new(lat_deg: f64, lon_deg: f64) -> Self {
        Self { lat_deg, lon_deg }
    }
}

/// Haversine distance in kilometres on a spherical Earth.
///
/// No range validation is applied: NaN coordinates yield NaN and out-of-range
/// degrees are fed through the formula as-is.
pub fn haversine_km(from: LatLon, to: LatLon) -> f64 {
    let lat1 = from.lat_deg.to_radians();
    let lat2 = to.lat_deg.to_radians();
    let d_lat = lat2 - lat1;
    let d_lon = (to.lon_deg - from.lon_deg).to_radians();

    let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_point_is_zero() {
        let p = LatLon::new(-1.286389, 36.817223);
        assert_eq!(haversine_km(p, p), 0.0);
    }

    #[test]
    fn one_degree_of_latitude_matches_arc_length() {
        let d = haversine_km(LatLon::new(0.0, 0.0), LatLon::new(1.0, 0.0));
        let expected = EARTH_RADIUS_KM * 1.0_f64.to_radians();
        assert!((d - expected).abs() < 1e-9, "d={d} expected={expected}");
    }

    #[test]
    fn known_city_pair_is_close_to_reference() {
        // Lyon -> Paris, ~392.2 km
        let lyon = LatLon::new(45.7597, 4.8422);
        let paris = LatLon::new(48.8567, 2.3508);
        let d = haversine_km(lyon, paris);
        assert!((d - 392.2).abs() < 0.5, "d={d}");
    }

    #[test]
    fn nan_coordinate_propagates() {
        let d = haversine_km(LatLon::new(f64::NAN, 0.0), LatLon::new(1.0, 1.0));
        assert!(d.is_nan());
    }
}
