mod position;
mod static_data;

pub use position::{PositionHandler, POSITION_MESSAGE_TYPES};
pub use static_data::{StaticDataHandler, STATIC_MESSAGE_TYPES};

/// Metadata keys that have carried the display name.
const SHIP_NAME_KEYS: &[&str] = &["ShipName", "shipName", "ship_name"];
