//! Storage backend trait definition
//!
//! This module defines the `StorageBackend` trait that every database implementation
//! provides, and the `BackendConnector` that knows how to open one.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::StorageResult;
use crate::{AlarmEvent, Device, DeviceStatus, EncoderOutput, Output};

/// Health status of the storage backend
#[derive(Debug, Clone)]
pub struct HealthStatus {
    /// Is the backend operational?
    pub healthy: bool,

    /// Human-readable status message
    pub message: String,

    /// Additional backend-specific metadata
    pub metadata: HashMap<String, String>,
}

/// Trait for persistent storage backends
///
/// ## Upsert contract
///
/// `upsert_alarms` must be idempotent: presenting the same `event_id` twice leaves one row.
/// For an existing row only the mutable fields (severity, description) may change. The
/// insert-if-absent step must be a single atomic statement, never a read followed by a
/// write.
///
/// ## Error Handling
///
/// Implementations convert driver errors into `StorageError`, mapping anything that means
/// "the database is not reachable" to `StorageError::ConnectionFailed` so the caller can
/// reconnect.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Insert new alarms, refresh mutable fields of known ones
    ///
    /// Returns how many rows were newly inserted.
    async fn upsert_alarms(&self, alarms: &[AlarmEvent]) -> StorageResult<usize>;

    /// Newest alarm timestamp on record, used to seed the fetch cursor
    async fn latest_alarm_timestamp(&self) -> StorageResult<Option<DateTime<Utc>>>;

    async fn count_alarms(&self) -> StorageResult<usize>;

    /// Upsert devices by uuid, returns rows written
    async fn upsert_devices(&self, devices: &[Device]) -> StorageResult<usize>;

    /// Set the status of known devices, returns rows updated
    async fn update_device_statuses(&self, statuses: &[DeviceStatus]) -> StorageResult<usize>;

    /// Upsert outputs by uuid, returns rows written
    async fn upsert_outputs(&self, outputs: &[Output]) -> StorageResult<usize>;

    /// Upsert encoder outputs by their per-device key, returns rows written
    async fn upsert_encoder_outputs(&self, outputs: &[EncoderOutput]) -> StorageResult<usize>;

    /// Lightweight liveness check (e.g. `SELECT 1`)
    async fn health_check(&self) -> StorageResult<HealthStatus>;

    /// Close the backend and release resources
    async fn close(&self) -> StorageResult<()>;
}

/// Opens backends on demand
///
/// `AlarmStore` calls this lazily and again after a connection is lost.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn connect(&self) -> StorageResult<Arc<dyn StorageBackend>>;

    /// Where this connector points, for logs (never includes credentials)
    fn describe(&self) -> String;
}
