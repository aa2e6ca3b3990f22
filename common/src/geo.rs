//! Geographic coordinates and nearest-node selection.

use serde::{Deserialize, Serialize};

const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Coord {
    pub lat: f64,
    pub lon: f64,
}

impl Coord {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Great-circle distance in kilometres.
    pub fn distance_km(&self, other: &Coord) -> f64 {
        haversine_distance(self.lat, self.lon, other.lat, other.lon)
    }
}

pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();
    EARTH_RADIUS_KM * c
}

/// Candidate closest to `target`, or `None` when there are no candidates.
pub fn nearest<'a, T>(
    candidates: &'a [T],
    target: &Coord,
    coord_of: impl Fn(&T) -> Coord,
) -> Option<&'a T> {
    candidates.iter().min_by(|a, b| {
        let da = coord_of(a).distance_km(target);
        let db = coord_of(b).distance_km(target);
        da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_haversine_known_distance() {
        // London -> Paris is roughly 344 km
        let london = Coord::new(51.5074, -0.1278);
        let paris = Coord::new(48.8566, 2.3522);
        let d = london.distance_km(&paris);
        assert!((d - 344.0).abs() < 5.0, "got {}", d);
    }

    #[test]
    fn test_nearest() {
        let nodes = vec![
            ("tokyo", Coord::new(35.68, 139.69)),
            ("frankfurt", Coord::new(50.11, 8.68)),
            ("virginia", Coord::new(38.95, -77.45)),
        ];
        let berlin = Coord::new(52.52, 13.40);
        let best = nearest(&nodes, &berlin, |n| n.1).unwrap();
        assert_eq!(best.0, "frankfurt");

        let empty: Vec<(&str, Coord)> = vec![];
        assert!(nearest(&empty, &berlin, |n| n.1).is_none());
    }
}
