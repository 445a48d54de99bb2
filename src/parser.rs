//! Turns raw bridge payloads into [`Reading`]s.
//!
//! Two shapes exist: JSON objects published over MQTT, and the `"<float> kW"`
//! text body served by the HTTP endpoint.

use serde_derive::Deserialize;

use crate::error::ParseError;
use crate::reading::{DeviceIdentity, Message, Reading};

pub const ANNOUNCE_TOPIC: &str = "announce";

/// Both firmware generations' names for the instantaneous demand event.
pub const DEMAND_TOPICS: [&str; 2] = [
    "_zigbee_metering/event/metering/instantaneous_demand",
    "event/metering/instantaneous_demand",
];

const KILOWATT_UNIT: &str = "kW";

#[derive(Debug, Deserialize)]
struct AnnouncePayload {
    #[serde(rename = "eb_os_version", default)]
    eb_os_version: Option<String>,
    #[serde(default)]
    serial: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DemandPayload {
    demand: i64,
}

/// Decodes a message received on `topic`.
///
/// Returns `Ok(None)` for topics the bridge publishes but we do not consume.
pub fn decode(topic: &str, payload: &[u8]) -> Result<Option<Message>, ParseError> {
    if topic == ANNOUNCE_TOPIC {
        return parse_announce(payload).map(|identity| Some(Message::Announce(identity)));
    }
    if DEMAND_TOPICS.iter().any(|t| *t == topic) {
        return parse_demand(payload).map(|reading| Some(Message::Demand(reading)));
    }
    Ok(None)
}

pub fn parse_announce(payload: &[u8]) -> Result<DeviceIdentity, ParseError> {
    let announce: AnnouncePayload =
        serde_json::from_slice(payload).map_err(|e| json_error(payload, e))?;
    Ok(DeviceIdentity {
        serial: announce.serial,
        firmware_version: announce.eb_os_version,
    })
}

/// Parses a `{"demand": <watts>}` object. The value is already in watts.
pub fn parse_demand(payload: &[u8]) -> Result<Reading, ParseError> {
    let demand: DemandPayload =
        serde_json::from_slice(payload).map_err(|e| json_error(payload, e))?;
    let watts = u16::try_from(demand.demand).map_err(|_| ParseError::OutOfRange {
        payload: lossy(payload),
    })?;
    Ok(Reading::new(watts))
}

/// Parses a `"<float> kW"` body, truncating the watt value toward zero.
pub fn parse_kilowatts(body: &[u8]) -> Result<Reading, ParseError> {
    let text = lossy(body);
    let tokens: Vec<&str> = text.trim().split(' ').collect();
    if tokens.len() != 2 {
        return Err(ParseError::TokenCount { payload: text });
    }
    if tokens[1] != KILOWATT_UNIT {
        return Err(ParseError::Unit { payload: text });
    }
    let kilowatts: f64 = match tokens[0].parse() {
        Ok(value) => value,
        Err(_) => return Err(ParseError::Number { payload: text }),
    };

    let watts = (kilowatts * 1000.0).trunc();
    if !watts.is_finite() || watts < 0.0 || watts > f64::from(u16::MAX) {
        return Err(ParseError::OutOfRange { payload: text });
    }
    Ok(Reading::new(watts as u16))
}

fn json_error(payload: &[u8], err: serde_json::Error) -> ParseError {
    ParseError::Json {
        payload: lossy(payload),
        reason: err.to_string(),
    }
}

fn lossy(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload).into_owned()
}
