//! In-memory storage backend (no persistence)
//!
//! Useful for:
//! - Running the collector against MCS without a database (dry runs)
//! - Tests that need real upsert semantics without SQL
//!
//! All data is lost on restart.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use super::backend::{HealthStatus, StorageBackend};
use super::error::StorageResult;
use crate::{AlarmEvent, Device, DeviceStatus, EncoderOutput, Output};

#[derive(Debug, Clone, PartialEq)]
pub struct StoredDevice {
    pub device: Device,
    pub status: Option<String>,
}

#[derive(Default)]
struct Tables {
    alarms: HashMap<String, AlarmEvent>,
    devices: HashMap<String, StoredDevice>,
    outputs: HashMap<String, Output>,
    encoder_outputs: HashMap<String, EncoderOutput>,
}

#[derive(Default)]
pub struct MemoryBackend {
    tables: RwLock<Tables>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn alarm(&self, event_id: &str) -> Option<AlarmEvent> {
        self.tables.read().await.alarms.get(event_id).cloned()
    }

    pub async fn device(&self, uuid: &str) -> Option<StoredDevice> {
        self.tables.read().await.devices.get(uuid).cloned()
    }

    pub async fn output(&self, uuid: &str) -> Option<Output> {
        self.tables.read().await.outputs.get(uuid).cloned()
    }

    pub async fn encoder_output(&self, uuid: &str) -> Option<EncoderOutput> {
        self.tables.read().await.encoder_outputs.get(uuid).cloned()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn upsert_alarms(&self, alarms: &[AlarmEvent]) -> StorageResult<usize> {
        let mut tables = self.tables.write().await;
        let mut inserted = 0;

        for alarm in alarms {
            match tables.alarms.get_mut(&alarm.event_id) {
                Some(existing) => {
                    existing.severity = alarm.severity.clone();
                    existing.description = alarm.description.clone();
                }
                None => {
                    tables.alarms.insert(alarm.event_id.clone(), alarm.clone());
                    inserted += 1;
                }
            }
        }

        debug!("in-memory upsert: {} new of {}", inserted, alarms.len());
        Ok(inserted)
    }

    async fn latest_alarm_timestamp(&self) -> StorageResult<Option<DateTime<Utc>>> {
        Ok(self
            .tables
            .read()
            .await
            .alarms
            .values()
            .map(|a| a.timestamp)
            .max())
    }

    async fn count_alarms(&self) -> StorageResult<usize> {
        Ok(self.tables.read().await.alarms.len())
    }

    async fn upsert_devices(&self, devices: &[Device]) -> StorageResult<usize> {
        let mut tables = self.tables.write().await;

        for device in devices {
            let status = tables
                .devices
                .get(&device.uuid)
                .and_then(|stored| stored.status.clone());
            tables.devices.insert(
                device.uuid.clone(),
                StoredDevice {
                    device: device.clone(),
                    status,
                },
            );
        }

        Ok(devices.len())
    }

    async fn update_device_statuses(&self, statuses: &[DeviceStatus]) -> StorageResult<usize> {
        let mut tables = self.tables.write().await;
        let mut updated = 0;

        for status in statuses {
            if let Some(stored) = tables.devices.get_mut(&status.uuid) {
                stored.status = status.status.clone();
                updated += 1;
            }
        }

        Ok(updated)
    }

    async fn upsert_outputs(&self, outputs: &[Output]) -> StorageResult<usize> {
        let mut tables = self.tables.write().await;

        for output in outputs {
            tables.outputs.insert(output.uuid.clone(), output.clone());
        }

        Ok(outputs.len())
    }

    async fn upsert_encoder_outputs(&self, outputs: &[EncoderOutput]) -> StorageResult<usize> {
        let mut tables = self.tables.write().await;

        for output in outputs {
            tables
                .encoder_outputs
                .insert(output.uuid.clone(), output.clone());
        }

        Ok(outputs.len())
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        let tables = self.tables.read().await;

        Ok(HealthStatus {
            healthy: true,
            message: "In-memory storage operational".to_string(),
            metadata: HashMap::from([
                ("backend".to_string(), "memory".to_string()),
                ("alarms".to_string(), tables.alarms.len().to_string()),
                ("devices".to_string(), tables.devices.len().to_string()),
            ]),
        })
    }

    async fn close(&self) -> StorageResult<()> {
        debug!("closing in-memory backend (no-op)");
        Ok(())
    }
}
