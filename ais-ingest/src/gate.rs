//! Decide whether two observations of the same vessel are different enough to keep both.
use crate::config::GateConfig;

/// Mean Earth radius used by the haversine distance, in meters.
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// A point in time and, when known, space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    /// `(longitude, latitude)` in degrees.
    pub position: Option<(f64, f64)>,
    /// Milliseconds since the Unix epoch.
    pub ts_ms: i64,
}

impl Observation {
    pub fn at(lon: f64, lat: f64, ts_ms: i64) -> Self {
        Self {
            position: Some((lon, lat)),
            ts_ms,
        }
    }

    pub fn without_position(ts_ms: i64) -> Self {
        Self {
            position: None,
            ts_ms,
        }
    }
}

/// Great-circle distance in meters between two `(longitude, latitude)` points.
pub fn haversine_meters(lon0: f64, lat0: f64, lon1: f64, lat1: f64) -> f64 {
    let d_lat = (lat1 - lat0).to_radians();
    let d_lon = (lon1 - lon0).to_radians();

    let a = (d_lat / 2.0).sin().powi(2)
        + lat0.to_radians().cos() * lat1.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_METERS * c
}

#[derive(Debug, Clone, Copy)]
pub struct Gate {
    min_distance_meters: f64,
    min_time_diff_ms: i64,
}

impl Gate {
    pub fn new(config: GateConfig) -> Self {
        Self {
            min_distance_meters: config.min_distance_meters,
            min_time_diff_ms: config.min_time_diff_ms,
        }
    }

    /// Retain `current` when there is no prior observation, when it moved at least the
    /// minimum distance, or when at least the minimum time elapsed. A missing coordinate on
    /// either side leaves only the elapsed-time test.
    pub fn should_retain(&self, last: Option<&Observation>, current: &Observation) -> bool {
        let Some(last) = last else {
            return current.position.is_some();
        };

        let elapsed_ms = current.ts_ms - last.ts_ms;
        if elapsed_ms >= self.min_time_diff_ms {
            return true;
        }

        match (last.position, current.position) {
            (Some((lon0, lat0)), Some((lon1, lat1))) => {
                haversine_meters(lon0, lat0, lon1, lat1) >= self.min_distance_meters
            }
            _ => false,
        }
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new(GateConfig::default())
    }
}
