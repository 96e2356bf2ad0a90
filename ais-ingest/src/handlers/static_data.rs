use ais_common::ais::{clean_text, Dimension, Envelope, Eta, ShipStaticData, StaticDataReport};
use ais_common::store::{StaticReport, VesselStore};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tracing::debug;

use super::SHIP_NAME_KEYS;
use crate::dispatch::MessageHandler;
use crate::error::HandlerError;

/// Wire labels of static and voyage related reports.
pub const STATIC_MESSAGE_TYPES: &[&str] = &["ShipStaticData", "StaticReport", "StaticDataReport"];

/// Upserts vessel reference data: identity, dimensions, type and voyage details.
pub struct StaticDataHandler {}

impl StaticDataHandler {
    fn decode(envelope: &Envelope) -> Result<StaticReport, HandlerError> {
        let report = match envelope.message_type.as_str() {
            // Class B sends its static data in two independent halves.
            "StaticDataReport" => {
                let payload: StaticDataReport = envelope.payload()?;
                let mut report = StaticReport::default();

                if let Some(part_a) = payload.report_a.filter(|a| a.valid) {
                    report.ship_name = part_a.name.as_deref().and_then(clean_text);
                }
                if let Some(part_b) = payload.report_b.filter(|b| b.valid) {
                    report.call_sign = part_b.call_sign.as_deref().and_then(clean_text);
                    report.ship_type = part_b.ship_type;
                    apply_dimension(&mut report, part_b.dimension);
                }

                report
            }
            _ => {
                let payload: ShipStaticData = envelope.payload()?;
                let mut report = StaticReport {
                    imo: payload.imo_number.filter(|imo| *imo > 0),
                    call_sign: payload.call_sign.as_deref().and_then(clean_text),
                    ship_name: payload.name.as_deref().and_then(clean_text),
                    destination: payload.destination.as_deref().and_then(clean_text),
                    ship_type: payload.ship_type,
                    max_draught: payload.maximum_static_draught,
                    eta: payload.eta.as_ref().and_then(eta),
                    ..Default::default()
                };
                apply_dimension(&mut report, payload.dimension);

                report
            }
        };

        Ok(StaticReport {
            mmsi: envelope.mmsi(),
            ship_name: report
                .ship_name
                .or_else(|| envelope.metadata_text(SHIP_NAME_KEYS)),
            ..report
        })
    }
}

fn apply_dimension(report: &mut StaticReport, dimension: Option<Dimension>) {
    if let Some(dimension) = dimension {
        report.dimension_a = dimension.a;
        report.dimension_b = dimension.b;
        report.dimension_c = dimension.c;
        report.dimension_d = dimension.d;
    }
}

/// The estimated arrival in UTC. Needs year, month, day and minute; the hour defaults to
/// midnight. AIS "not available" markers produce an impossible date and no ETA.
fn eta(eta: &Eta) -> Option<DateTime<Utc>> {
    Utc.with_ymd_and_hms(
        eta.year?,
        eta.month?,
        eta.day?,
        eta.hour.unwrap_or(0),
        eta.minute?,
        0,
    )
    .single()
}

#[async_trait]
impl MessageHandler for StaticDataHandler {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn handle(
        &self,
        store: &dyn VesselStore,
        envelope: &Envelope,
    ) -> Result<(), HandlerError> {
        let report = Self::decode(envelope)?;
        if report.mmsi.is_none() {
            debug!(
                message_type = %envelope.message_type,
                "static report without MMSI, dropping"
            );
            return Ok(());
        }

        store.upsert_static_report(&report).await?;
        Ok(())
    }
}
