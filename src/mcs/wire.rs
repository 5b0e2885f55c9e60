//! MCS response bodies
//!
//! MCS wraps list results as `{"data": [...]}`. Older firmware returns the bare array, and
//! an empty result may come back as `null`, `[]` or no body at all. All of those decode to
//! an empty list. A body that is not one of these shapes is a `Malformed` error; a single
//! element that does not decode is logged and skipped so one odd alarm cannot stall
//! ingestion of the rest.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use super::error::FetchError;
use crate::{AlarmEvent, Device, DeviceStatus, EncoderOutput, Output};

/// Values above this are taken to be epoch milliseconds rather than seconds
const EPOCH_MILLIS_THRESHOLD: u64 = 100_000_000_000;

#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Text(String),
    Number(serde_json::Number),
}

impl Scalar {
    fn into_string(self) -> String {
        match self {
            Scalar::Text(text) => text,
            Scalar::Number(number) => number.to_string(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireTimestamp {
    Text(String),
    Epoch(i64),
}

impl WireTimestamp {
    fn parse(self) -> Result<DateTime<Utc>, String> {
        match self {
            WireTimestamp::Text(text) => DateTime::parse_from_rfc3339(&text)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|e| format!("invalid timestamp '{text}': {e}")),
            WireTimestamp::Epoch(value) => {
                let parsed = if value.unsigned_abs() >= EPOCH_MILLIS_THRESHOLD {
                    DateTime::from_timestamp_millis(value)
                } else {
                    DateTime::from_timestamp(value, 0)
                };
                parsed.ok_or_else(|| format!("timestamp {value} out of range"))
            }
        }
    }
}

#[derive(Deserialize)]
struct WireAlarm {
    #[serde(alias = "uuid", alias = "event_id", alias = "alarm_id")]
    id: Scalar,
    #[serde(alias = "time", alias = "created_at", alias = "raised_at")]
    timestamp: WireTimestamp,
    #[serde(default)]
    severity: Option<Scalar>,
    #[serde(default, alias = "message", alias = "label")]
    description: Option<String>,
}

#[derive(Deserialize)]
struct WireAccess {
    #[serde(default)]
    url: Option<String>,
}

#[derive(Deserialize)]
struct WireDevice {
    uuid: String,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    access: Option<WireAccess>,
}

#[derive(Deserialize)]
struct WireDeviceStatus {
    uuid: String,
    #[serde(default)]
    status: Option<String>,
}

/// One entry of an encoder's own output list
#[derive(Deserialize)]
struct WireEncoderItem {
    #[serde(rename = "Encoder")]
    encoder: WireEncoder,
}

#[derive(Deserialize)]
struct WireEncoder {
    uuid: Scalar,
    #[serde(default)]
    id: Option<Scalar>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    is_enabled: Option<bool>,
}

#[derive(Deserialize)]
struct WireOutput {
    uuid: String,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    device: Option<String>,
}

/// Pull the list of items out of a response body
fn items(body: Option<&str>) -> Result<Vec<serde_json::Value>, FetchError> {
    let body = match body {
        Some(body) if !body.trim().is_empty() => body,
        _ => return Ok(Vec::new()),
    };

    let value: serde_json::Value =
        serde_json::from_str(body).map_err(|e| FetchError::Malformed(e.to_string()))?;

    let list = match value {
        serde_json::Value::Object(mut object) => match object.remove("data") {
            Some(data) => data,
            None => {
                return Err(FetchError::Malformed(
                    "response object has no 'data' field".to_string(),
                ));
            }
        },
        other => other,
    };

    match list {
        serde_json::Value::Array(items) => Ok(items),
        serde_json::Value::Null => Ok(Vec::new()),
        other => Err(FetchError::Malformed(format!(
            "expected a list, got {}",
            type_name(&other)
        ))),
    }
}

fn type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "a list",
        serde_json::Value::Object(_) => "an object",
    }
}

fn decode_each<W, T>(
    body: Option<&str>,
    kind: &str,
    convert: impl Fn(W, serde_json::Value) -> Result<T, String>,
) -> Result<Vec<T>, FetchError>
where
    W: DeserializeOwned,
{
    let mut decoded = Vec::new();

    for (index, item) in items(body)?.into_iter().enumerate() {
        let result = serde_json::from_value::<W>(item.clone())
            .map_err(|e| e.to_string())
            .and_then(|wire| convert(wire, item));

        match result {
            Ok(value) => decoded.push(value),
            Err(e) => warn!("skipping {kind} #{index}: {e}"),
        }
    }

    Ok(decoded)
}

/// Alarms in the order MCS listed them
pub fn parse_alarms(body: Option<&str>) -> Result<Vec<AlarmEvent>, FetchError> {
    decode_each(body, "alarm", |wire: WireAlarm, raw| {
        let event_id = wire.id.into_string();
        if event_id.trim().is_empty() {
            return Err("empty alarm id".to_string());
        }

        Ok(AlarmEvent {
            event_id,
            timestamp: wire.timestamp.parse()?,
            severity: wire
                .severity
                .map(Scalar::into_string)
                .unwrap_or_else(|| "unknown".to_string()),
            description: wire.description.unwrap_or_default(),
            raw_payload: raw,
        })
    })
}

pub fn parse_devices(body: Option<&str>) -> Result<Vec<Device>, FetchError> {
    decode_each(body, "device", |wire: WireDevice, _| {
        Ok(Device {
            uuid: wire.uuid,
            label: wire.label,
            ip: wire.access.and_then(|access| access.url),
        })
    })
}

pub fn parse_device_statuses(body: Option<&str>) -> Result<Vec<DeviceStatus>, FetchError> {
    decode_each(body, "device status", |wire: WireDeviceStatus, _| {
        Ok(DeviceStatus {
            uuid: wire.uuid,
            status: wire.status,
        })
    })
}

pub fn parse_outputs(body: Option<&str>) -> Result<Vec<Output>, FetchError> {
    decode_each(body, "output", |wire: WireOutput, _| {
        Ok(Output {
            uuid: wire.uuid,
            label: wire.label,
            device_uuid: wire.device,
        })
    })
}

/// Outputs reported by the encoder at `device_ip`
pub fn parse_encoder_outputs(
    device_ip: &str,
    body: Option<&str>,
) -> Result<Vec<EncoderOutput>, FetchError> {
    decode_each(body, "encoder output", |item: WireEncoderItem, _| {
        let encoder_uuid = item.encoder.uuid.into_string();
        if encoder_uuid.trim().is_empty() {
            return Err("empty encoder uuid".to_string());
        }

        Ok(EncoderOutput {
            uuid: format!("{device_ip}_{encoder_uuid}"),
            device_ip: device_ip.to_string(),
            encoder_uuid,
            encoder_id: item.encoder.id.map(Scalar::into_string),
            label: item.encoder.title,
            enabled: item.encoder.is_enabled,
        })
    })
}
