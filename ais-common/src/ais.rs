//! Wire types for the AIS stream: the subscription frame we send and the envelopes we receive.
use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Metadata keys that have carried the vessel identity over the lifetime of the feed.
const METADATA_MMSI_KEYS: &[&str] = &["MMSI", "mmsi", "Mmsi", "MMSI_String"];
/// Payload keys checked when the metadata block has no identity.
const PAYLOAD_MMSI_KEYS: &[&str] = &["UserID", "MMSI", "mmsi"];

/// Maritime Mobile Service Identity: the stable numeric identity of a vessel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Mmsi(pub i64);

impl Mmsi {
    /// Read an identity from a JSON value. Accepts numbers and numeric strings; zero and
    /// negative values are treated as absent.
    pub fn from_value(value: &Value) -> Option<Self> {
        let raw = match value {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        }?;

        (raw > 0).then_some(Mmsi(raw))
    }
}

impl fmt::Display for Mmsi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors extracting a typed payload out of an `Envelope`.
#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("envelope of type {0} carries no payload under Message.{0}")]
    Missing(String),
    #[error("payload of type {message_type} could not be decoded: {error}")]
    Decode {
        message_type: String,
        error: serde_json::Error,
    },
}

/// A single decoded frame from the stream.
///
/// The payload lives under `Message.<MessageType>`, so it is kept as raw JSON until a handler
/// asks for it with the type it expects.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    #[serde(rename = "MessageType")]
    pub message_type: String,
    #[serde(rename = "MetaData", alias = "Metadata", alias = "metadata", default)]
    pub metadata: Map<String, Value>,
    #[serde(rename = "Message", default)]
    pub message: Map<String, Value>,
}

impl Envelope {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// The raw payload block for this envelope's type, if present.
    pub fn raw_payload(&self) -> Option<&Value> {
        self.message.get(&self.message_type)
    }

    /// Decode the payload block into the type a handler expects.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, PayloadError> {
        let value = self
            .raw_payload()
            .ok_or_else(|| PayloadError::Missing(self.message_type.clone()))?;

        T::deserialize(value).map_err(|error| PayloadError::Decode {
            message_type: self.message_type.clone(),
            error,
        })
    }

    /// Resolve the vessel identity, preferring the metadata block over the payload.
    pub fn mmsi(&self) -> Option<Mmsi> {
        let from_metadata = METADATA_MMSI_KEYS
            .iter()
            .filter_map(|key| self.metadata.get(*key))
            .find_map(Mmsi::from_value);

        from_metadata.or_else(|| {
            let payload = self.raw_payload()?.as_object()?;
            PAYLOAD_MMSI_KEYS
                .iter()
                .filter_map(|key| payload.get(*key))
                .find_map(Mmsi::from_value)
        })
    }

    /// First metadata value found under any of `keys`.
    pub fn metadata_value(&self, keys: &[&str]) -> Option<&Value> {
        keys.iter().find_map(|key| self.metadata.get(*key))
    }

    /// First non-empty metadata string found under any of `keys`, with AIS padding removed.
    pub fn metadata_text(&self, keys: &[&str]) -> Option<String> {
        keys.iter()
            .filter_map(|key| self.metadata.get(*key))
            .filter_map(Value::as_str)
            .find_map(clean_text)
    }
}

/// AIS text fields are fixed width and padded with `@` or spaces.
pub fn clean_text(raw: &str) -> Option<String> {
    let trimmed = raw.trim_end_matches(|c: char| c == '@' || c.is_whitespace()).trim();
    (!trimmed.is_empty()).then(|| trimmed.to_owned())
}

/// Payload shared by `PositionReport` and the two class B position variants.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PositionReport {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub navigational_status: Option<i32>,
    pub rate_of_turn: Option<f64>,
    pub sog: Option<f64>,
    pub cog: Option<f64>,
    pub true_heading: Option<i32>,
    pub special_manoeuvre_indicator: Option<i32>,
    /// Only carried by extended class B reports.
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Dimension {
    #[serde(rename = "A")]
    pub a: Option<i32>,
    #[serde(rename = "B")]
    pub b: Option<i32>,
    #[serde(rename = "C")]
    pub c: Option<i32>,
    #[serde(rename = "D")]
    pub d: Option<i32>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Eta {
    pub year: Option<i32>,
    pub month: Option<u32>,
    pub day: Option<u32>,
    pub hour: Option<u32>,
    pub minute: Option<u32>,
}

/// Payload of `ShipStaticData` and the legacy `StaticReport` label.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ShipStaticData {
    pub imo_number: Option<i64>,
    #[serde(alias = "callSign")]
    pub call_sign: Option<String>,
    #[serde(alias = "name")]
    pub name: Option<String>,
    #[serde(alias = "destination")]
    pub destination: Option<String>,
    pub dimension: Option<Dimension>,
    #[serde(rename = "Type")]
    pub ship_type: Option<i32>,
    pub maximum_static_draught: Option<f64>,
    pub eta: Option<Eta>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StaticReportPartA {
    #[serde(default)]
    pub valid: bool,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StaticReportPartB {
    #[serde(default)]
    pub valid: bool,
    pub call_sign: Option<String>,
    pub ship_type: Option<i32>,
    pub dimension: Option<Dimension>,
}

/// Class B static data, split over two independently transmitted parts.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StaticDataReport {
    pub report_a: Option<StaticReportPartA>,
    pub report_b: Option<StaticReportPartB>,
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("bounding box must be `min_lon,min_lat,max_lon,max_lat` within valid coordinate ranges")]
pub struct ParseBoundingBoxError;

/// A geographic filter for the subscription.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub const GLOBAL: BoundingBox = BoundingBox {
        min_lon: -180.0,
        min_lat: -90.0,
        max_lon: 180.0,
        max_lat: 90.0,
    };

    /// Corners in the `[[lat, lon], [lat, lon]]` order the stream expects.
    fn corners(&self) -> [[f64; 2]; 2] {
        [[self.min_lat, self.min_lon], [self.max_lat, self.max_lon]]
    }
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self::GLOBAL
    }
}

impl FromStr for BoundingBox {
    type Err = ParseBoundingBoxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = s
            .split(',')
            .map(|part| part.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| ParseBoundingBoxError)?;

        let [min_lon, min_lat, max_lon, max_lat] = parts[..] else {
            return Err(ParseBoundingBoxError);
        };

        let lon_ok = |v: f64| (-180.0..=180.0).contains(&v);
        let lat_ok = |v: f64| (-90.0..=90.0).contains(&v);
        if !(lon_ok(min_lon) && lon_ok(max_lon) && lat_ok(min_lat) && lat_ok(max_lat))
            || min_lon > max_lon
            || min_lat > max_lat
        {
            return Err(ParseBoundingBoxError);
        }

        Ok(BoundingBox {
            min_lon,
            min_lat,
            max_lon,
            max_lat,
        })
    }
}

/// The single frame sent after every successful connect.
#[derive(Serialize)]
pub struct Subscription<'a> {
    #[serde(rename = "APIKey")]
    api_key: &'a str,
    #[serde(rename = "BoundingBoxes")]
    bounding_boxes: Vec<[[f64; 2]; 2]>,
}

impl<'a> Subscription<'a> {
    pub fn new(api_key: &'a str, boxes: &[BoundingBox]) -> Self {
        Self {
            api_key,
            bounding_boxes: boxes.iter().map(BoundingBox::corners).collect(),
        }
    }
}

// Hand written so the key can never end up in a log line through `{:?}`.
impl fmt::Debug for Subscription<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("api_key", &"<redacted>")
            .field("bounding_boxes", &self.bounding_boxes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_position_envelope() {
        let raw = json!({
            "MessageType": "PositionReport",
            "MetaData": {
                "MMSI": 123456789,
                "ShipName": "NORDIC STAR @@@@   ",
                "time_utc": "2024-01-01 12:00:00.000000 +0000 UTC"
            },
            "Message": {
                "PositionReport": {
                    "UserID": 123456789,
                    "Latitude": 10.0,
                    "Longitude": 20.0,
                    "Sog": 12.3,
                    "NavigationalStatus": 0
                }
            }
        })
        .to_string();

        let envelope = Envelope::parse(&raw).expect("failed to parse envelope");
        assert_eq!(envelope.message_type, "PositionReport");
        assert_eq!(envelope.mmsi(), Some(Mmsi(123456789)));
        assert_eq!(
            envelope.metadata_text(&["ShipName"]),
            Some("NORDIC STAR".to_owned())
        );

        let report: PositionReport = envelope.payload().expect("failed to decode payload");
        assert_eq!(report.latitude, Some(10.0));
        assert_eq!(report.longitude, Some(20.0));
        assert_eq!(report.sog, Some(12.3));
        assert_eq!(report.cog, None);
    }

    #[test]
    fn test_envelope_without_discriminator_is_rejected() {
        assert!(Envelope::parse(r#"{"MetaData": {}, "Message": {}}"#).is_err());
        assert!(Envelope::parse("not json").is_err());
    }

    #[test]
    fn test_mmsi_legacy_spellings() {
        let from_string = Envelope::parse(
            r#"{"MessageType": "PositionReport", "Metadata": {"mmsi": " 987654321 "}}"#,
        )
        .unwrap();
        assert_eq!(from_string.mmsi(), Some(Mmsi(987654321)));

        let from_payload = Envelope::parse(
            r#"{"MessageType": "PositionReport", "Message": {"PositionReport": {"UserID": 111222333}}}"#,
        )
        .unwrap();
        assert_eq!(from_payload.mmsi(), Some(Mmsi(111222333)));

        let zero = Envelope::parse(r#"{"MessageType": "PositionReport", "MetaData": {"MMSI": 0}}"#)
            .unwrap();
        assert_eq!(zero.mmsi(), None);
    }

    #[test]
    fn test_missing_payload() {
        let envelope = Envelope::parse(r#"{"MessageType": "PositionReport"}"#).unwrap();
        let result: Result<PositionReport, _> = envelope.payload();
        assert!(matches!(result, Err(PayloadError::Missing(t)) if t == "PositionReport"));
    }

    #[test]
    fn test_bounding_box_from_str() {
        let global: BoundingBox = "-180,-90,180,90".parse().unwrap();
        assert_eq!(global, BoundingBox::GLOBAL);

        let north_sea: BoundingBox = "-4.5, 51.0, 9.0, 61.0".parse().unwrap();
        assert_eq!(north_sea.min_lat, 51.0);

        assert_eq!("1,2,3".parse::<BoundingBox>(), Err(ParseBoundingBoxError));
        assert_eq!("0,0,200,10".parse::<BoundingBox>(), Err(ParseBoundingBoxError));
        assert_eq!("10,0,0,10".parse::<BoundingBox>(), Err(ParseBoundingBoxError));
    }

    #[test]
    fn test_subscription_never_prints_key() {
        let subscription = Subscription::new("super-secret", &[BoundingBox::GLOBAL]);
        let printed = format!("{:?}", subscription);
        assert!(!printed.contains("super-secret"));

        let encoded = serde_json::to_value(&subscription).unwrap();
        assert_eq!(encoded["APIKey"], "super-secret");
        assert_eq!(encoded["BoundingBoxes"], json!([[[-90.0, -180.0], [90.0, 180.0]]]));
    }

    #[test]
    fn test_clean_text() {
        assert_eq!(clean_text("EVER GIVEN@@@@"), Some("EVER GIVEN".to_owned()));
        assert_eq!(clean_text("   "), None);
        assert_eq!(clean_text("@@@@"), None);
    }
}
