//! Coordinate decoding, great-circle distance and content hashing.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Projected place-search coordinates are degrees scaled by this factor.
const MAP_XY_SCALE: f64 = 1e7;

const LAT_BOUNDS: (f64, f64) = (33.0, 39.5);
const LNG_BOUNDS: (f64, f64) = (124.0, 132.0);

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn distance_to(&self, other: &Coordinate) -> f64 {
        haversine_meters(self.lat, self.lng, other.lat, other.lng)
    }

    /// True when the point falls inside the national bounding box.
    pub fn is_plausible(&self) -> bool {
        (LAT_BOUNDS.0..=LAT_BOUNDS.1).contains(&self.lat)
            && (LNG_BOUNDS.0..=LNG_BOUNDS.1).contains(&self.lng)
    }
}

/// Decode `mapx`/`mapy` from a place-search hit into latitude/longitude.
///
/// Returns `None` for non-numeric input or points outside the bounding box.
pub fn decode_map_xy(mapx: &str, mapy: &str) -> Option<Coordinate> {
    let x: f64 = mapx.trim().parse().ok()?;
    let y: f64 = mapy.trim().parse().ok()?;
    let coord = Coordinate::new(y / MAP_XY_SCALE, x / MAP_XY_SCALE);
    coord.is_plausible().then_some(coord)
}

/// Haversine distance in meters.
pub fn haversine_meters(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlng = (lng2 - lng1).to_radians();

    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlng / 2.0).sin().powi(2);

    2.0 * a.sqrt().asin() * EARTH_RADIUS_METERS
}

/// Strip bracket characters and turn slashes into spaces before a place search.
pub fn clean_search_query(query: &str) -> String {
    query
        .trim()
        .replace(['[', ']'], "")
        .replace('/', " ")
        .trim()
        .to_string()
}

/// Stable cache key for a title or address.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_projected_coordinates() {
        let c = decode_map_xy("1269876543", "375123456").expect("valid");
        assert!((c.lat - 37.5123456).abs() < 1e-9);
        assert!((c.lng - 126.9876543).abs() < 1e-9);
    }

    #[test]
    fn rejects_zero_and_garbage() {
        assert!(decode_map_xy("0", "0").is_none());
        assert!(decode_map_xy("abc", "375123456").is_none());
        assert!(decode_map_xy("1269876543", "").is_none());
        assert!(decode_map_xy("NaN", "NaN").is_none());
    }

    #[test]
    fn rejects_points_outside_bounding_box() {
        // Tokyo
        assert!(decode_map_xy("1396917000", "356895000").is_none());
    }

    #[test]
    fn seoul_station_to_gangnam_is_about_eight_km() {
        let d = haversine_meters(37.5547, 126.9707, 37.4979, 127.0276);
        assert!(d > 7_000.0 && d < 9_000.0, "got {d}m");
    }

    #[test]
    fn distance_to_self_is_zero() {
        let c = Coordinate::new(37.5, 127.0);
        assert!(c.distance_to(&c).abs() < 1e-6);
    }

    #[test]
    fn query_cleaning_strips_brackets_and_slashes() {
        assert_eq!(clean_search_query(" [강남] 파스타/와인 "), "강남 파스타 와인");
    }

    #[test]
    fn content_hash_is_stable_hex() {
        assert_eq!(
            content_hash("hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }
}
