pub mod actors;
pub mod config;
pub mod ingest;
pub mod mcs;
pub mod retry;
pub mod storage;
pub mod time;
pub mod util;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single alarm raised by the MCS, as persisted by the collector.
///
/// `event_id` is stable per source system. MCS hands it out either as a string or as an
/// integer; it is always normalized to its string form here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub severity: String,
    pub description: String,
    /// The alarm exactly as MCS returned it
    pub raw_payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub uuid: String,
    pub label: Option<String>,
    pub ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub uuid: String,
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Output {
    pub uuid: String,
    pub label: Option<String>,
    pub device_uuid: Option<String>,
}

/// An encoder output as reported by the device itself rather than by MCS
///
/// Encoder uuids are only unique per device, so `uuid` is `{device_ip}_{encoder_uuid}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderOutput {
    pub uuid: String,
    pub device_ip: String,
    pub encoder_uuid: String,
    pub encoder_id: Option<String>,
    pub label: Option<String>,
    pub enabled: Option<bool>,
}
