use std::sync::Arc;

use ais_common::ais::{clean_text, Envelope, PositionReport};
use ais_common::store::{CurrentPosition, HistoryRecord, Kinematics, VesselStore};
use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use super::SHIP_NAME_KEYS;
use crate::buffer::HistoryBuffer;
use crate::cache::LastObservedCache;
use crate::dispatch::MessageHandler;
use crate::error::HandlerError;
use crate::gate::{Gate, Observation};
use crate::metrics_consts::{POSITIONS_DISCARDED, POSITIONS_INVALID};
use crate::timestamp::parse_observed_at;

/// Wire labels of the three position report variants, all sharing one payload shape.
pub const POSITION_MESSAGE_TYPES: &[&str] = &[
    "PositionReport",
    "StandardClassBPositionReport",
    "ExtendedClassBPositionReport",
];

const TIMESTAMP_KEYS: &[&str] = &["time_utc", "TimeUtc", "timestamp"];

/// Keeps the current position of each vessel up to date, and feeds observations that pass
/// the gate into the history buffer.
pub struct PositionHandler {
    gate: Gate,
    cache: Arc<LastObservedCache>,
    buffer: Arc<HistoryBuffer>,
}

impl PositionHandler {
    pub fn new(gate: Gate, cache: Arc<LastObservedCache>, buffer: Arc<HistoryBuffer>) -> Self {
        Self {
            gate,
            cache,
            buffer,
        }
    }
}

/// `(longitude, latitude)` when both are present and in range.
fn valid_position(longitude: Option<f64>, latitude: Option<f64>) -> Option<(f64, f64)> {
    let (lon, lat) = (longitude?, latitude?);
    let in_range = (-180.0..=180.0).contains(&lon) && (-90.0..=90.0).contains(&lat);
    in_range.then_some((lon, lat))
}

#[async_trait]
impl MessageHandler for PositionHandler {
    fn name(&self) -> &'static str {
        "position"
    }

    async fn handle(
        &self,
        store: &dyn VesselStore,
        envelope: &Envelope,
    ) -> Result<(), HandlerError> {
        let Some(mmsi) = envelope.mmsi() else {
            debug!(
                message_type = %envelope.message_type,
                "position report without MMSI, dropping"
            );
            metrics::counter!(POSITIONS_DISCARDED, "reason" => "missing_mmsi").increment(1);
            return Ok(());
        };

        let report: PositionReport = envelope.payload()?;

        let position = valid_position(report.longitude, report.latitude);
        if position.is_none() {
            debug!(
                %mmsi,
                longitude = ?report.longitude,
                latitude = ?report.latitude,
                "position out of range, skipping history"
            );
            metrics::counter!(POSITIONS_INVALID).increment(1);
        }

        let observed_at = envelope
            .metadata_value(TIMESTAMP_KEYS)
            .and_then(parse_observed_at);
        if observed_at.is_none() {
            debug!(%mmsi, "unparsable observation time, skipping history");
        }

        let kinematics = Kinematics {
            navigational_status: report.navigational_status,
            rate_of_turn: report.rate_of_turn,
            speed_over_ground: report.sog,
            course_over_ground: report.cog,
            true_heading: report.true_heading,
            special_manoeuvre_indicator: report.special_manoeuvre_indicator,
        };

        let current = CurrentPosition {
            mmsi,
            ship_name: envelope
                .metadata_text(SHIP_NAME_KEYS)
                .or_else(|| report.name.as_deref().and_then(clean_text)),
            kinematics,
            longitude: position.map(|(lon, _)| lon),
            latitude: position.map(|(_, lat)| lat),
            observed_at,
        };
        // A failed upsert is reported after the history path has run, the two are independent.
        let upserted = store.upsert_current_position(&current).await;

        match (position, observed_at) {
            (Some((longitude, latitude)), Some(observed_at)) => {
                let observation =
                    Observation::at(longitude, latitude, observed_at.timestamp_millis());
                if self.cache.observe(mmsi, observation, &self.gate) {
                    self.buffer.push(HistoryRecord {
                        mmsi,
                        kinematics,
                        longitude,
                        latitude,
                        observed_at,
                    });
                } else {
                    metrics::counter!(POSITIONS_DISCARDED, "reason" => "gate").increment(1);
                }
            }
            (None, observed_at) => {
                let ts_ms = observed_at.unwrap_or_else(Utc::now).timestamp_millis();
                self.cache.invalidate_position(mmsi, ts_ms);
            }
            (Some(_), None) => self.cache.touch(mmsi, Utc::now().timestamp_millis()),
        }

        upserted.map_err(HandlerError::from)
    }
}
