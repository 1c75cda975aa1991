//! Great-circle math on (lat, lng) degree pairs.

use model::Coordinate;

/// Mean Earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Haversine distance in meters between two coordinates.
pub fn distance(a: Coordinate, b: Coordinate) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlat = lat2 - lat1;
    let dlng = (b.lng - a.lng).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    // fp overshoot near antipodes / identical points
    let h = h.clamp(0.0, 1.0);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_M * c
}

/// Displace `origin` by a local north/east offset in meters.
///
/// Flat-earth approximation, good for the tens-of-meters scale of a
/// walking step; not meant for long distances or the poles.
pub fn offset(origin: Coordinate, north_m: f64, east_m: f64) -> Coordinate {
    let dlat = north_m / EARTH_RADIUS_M;
    let dlng = east_m / (EARTH_RADIUS_M * origin.lat.to_radians().cos());
    Coordinate {
        lat: origin.lat + dlat.to_degrees(),
        lng: origin.lng + dlng.to_degrees(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(lat: f64, lng: f64) -> Coordinate {
        Coordinate::new(lat, lng)
    }

    #[test]
    fn identical_points_are_zero_apart() {
        let p = c(51.5007, -0.1246);
        assert_eq!(distance(p, p), 0.0);
    }

    #[test]
    fn distance_is_symmetric() {
        let pairs = [
            (c(51.5007, -0.1246), c(48.8584, 2.2945)),
            (c(-33.8568, 151.2153), c(40.6892, -74.0445)),
            (c(0.0, 179.9), c(0.0, -179.9)),
        ];
        for (a, b) in pairs {
            let ab = distance(a, b);
            let ba = distance(b, a);
            assert!((ab - ba).abs() < 1e-6, "{ab} vs {ba}");
        }
    }

    #[test]
    fn one_degree_of_latitude() {
        let d = distance(c(0.0, 0.0), c(1.0, 0.0));
        assert!((d - 111_194.93).abs() < 1.0, "got {d}");
    }

    #[test]
    fn antipodal_points_stay_finite() {
        let d = distance(c(0.0, 0.0), c(0.0, 180.0));
        assert!(d.is_finite());
        assert!((d - std::f64::consts::PI * EARTH_RADIUS_M).abs() < 1.0);

        let d = distance(c(45.0, 10.0), c(-45.0, -170.0));
        assert!((d - std::f64::consts::PI * EARTH_RADIUS_M).abs() < 1.0);
    }

    #[test]
    fn offset_matches_distance() {
        let origin = c(52.52, 13.405);
        let north = offset(origin, 20.0, 0.0);
        assert!((distance(origin, north) - 20.0).abs() < 1e-6);

        let east = offset(origin, 0.0, 15.0);
        assert!((distance(origin, east) - 15.0).abs() < 1e-3);
    }
}
