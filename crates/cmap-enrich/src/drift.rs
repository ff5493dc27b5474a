use cmap_core::{Coordinate, EnrichStats};
use tracing::{info, warn};

use crate::cache::CacheStore;
use crate::client::EnrichClient;

/// Distance beyond which a freshly resolved coordinate is distrusted.
pub const DRIFT_THRESHOLD_METERS: f64 = 50.0;

#[derive(Debug, Clone, Copy)]
pub struct DriftCorrector {
    threshold_meters: f64,
}

impl Default for DriftCorrector {
    fn default() -> Self {
        Self {
            threshold_meters: DRIFT_THRESHOLD_METERS,
        }
    }
}

impl DriftCorrector {
    pub fn new(threshold_meters: f64) -> Self {
        Self { threshold_meters }
    }

    /// Distance in meters when `resolved` drifted past the threshold.
    pub fn drift(&self, previous: Coordinate, resolved: Coordinate) -> Option<f64> {
        let distance = previous.distance_to(&resolved);
        (distance > self.threshold_meters).then_some(distance)
    }

    /// Re-geocode `address` when `resolved` drifted from `previous`, skipping
    /// the geocode cache and overwriting it with the corrected value.
    ///
    /// A failed re-lookup keeps `resolved`.
    pub async fn correct(
        &self,
        client: &EnrichClient,
        cache: &CacheStore,
        stats: &EnrichStats,
        address: &str,
        previous: Coordinate,
        resolved: Coordinate,
    ) -> Coordinate {
        let Some(distance) = self.drift(previous, resolved) else {
            return resolved;
        };
        info!(address, distance_m = distance.round(), "coordinate drift detected; re-geocoding");

        match client.geocode(address).await {
            Ok(Some(corrected)) => {
                stats.record_geocode();
                stats.record_drift_fix();
                cache.put_geocode(address, corrected).await;
                corrected
            }
            Ok(None) => {
                warn!(address, "drift re-geocode found nothing; keeping resolved coordinate");
                resolved
            }
            Err(err) => {
                warn!(address, error = %err, "drift re-geocode failed; keeping resolved coordinate");
                resolved
            }
        }
    }
}
