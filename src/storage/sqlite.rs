//! SQLite storage backend implementation
//!
//! This module provides a SQLite-based implementation of the `StorageBackend` trait.
//!
//! ## Features
//!
//! - **Embedded**: No separate database server required
//! - **WAL mode**: Better concurrency for reads during writes
//! - **Connection pooling**: Efficient resource usage
//! - **Migrations**: Automatic schema versioning with sqlx
//!
//! Timestamps are stored as unix milliseconds.
//!
//! ## Limitations
//!
//! - **Concurrency**: Limited concurrent writes (use PostgreSQL when several hosts share data)
//! - **Distributed**: Single-machine only

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use tracing::{debug, info, instrument, warn};

use super::backend::{HealthStatus, StorageBackend};
use super::error::{StorageError, StorageResult};
use crate::{AlarmEvent, Device, DeviceStatus, EncoderOutput, Output};

/// SQLite storage backend
///
/// Stores alarms and inventory in a local database file. Suited to single-host
/// deployments and to tests.
pub struct SqliteBackend {
    pool: Pool<Sqlite>,
    db_path: String,
}

impl SqliteBackend {
    /// Open (creating if needed) the database and run migrations
    #[instrument(skip_all)]
    pub async fn new(db_path: impl AsRef<Path>) -> StorageResult<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        info!("initializing SQLite backend at: {}", db_path_str);

        let options = SqliteConnectOptions::new()
            .filename(&db_path_str)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        debug!("running database migrations");
        sqlx::migrate!("./migrations/sqlite").run(&pool).await?;

        info!("SQLite backend ready");

        Ok(Self {
            pool,
            db_path: db_path_str,
        })
    }

    fn millis_to_timestamp(millis: i64) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(millis)
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    #[instrument(skip(self, alarms), fields(count = alarms.len()))]
    async fn upsert_alarms(&self, alarms: &[AlarmEvent]) -> StorageResult<usize> {
        if alarms.is_empty() {
            return Ok(0);
        }

        let now = Utc::now().timestamp_millis();
        let mut inserted = 0;
        let mut tx = self.pool.begin().await?;

        for alarm in alarms {
            let payload = serde_json::to_string(&alarm.raw_payload)?;

            let result = sqlx::query(
                r#"
                INSERT INTO alarms (
                    event_id, occurred_at, severity, description, raw_payload,
                    first_seen, last_updated
                )
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (event_id) DO NOTHING
                "#,
            )
            .bind(&alarm.event_id)
            .bind(alarm.timestamp.timestamp_millis())
            .bind(&alarm.severity)
            .bind(&alarm.description)
            .bind(payload)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 1 {
                inserted += 1;
                continue;
            }

            sqlx::query(
                r#"
                UPDATE alarms
                SET severity = ?, description = ?, last_updated = ?
                WHERE event_id = ? AND (severity <> ? OR description <> ?)
                "#,
            )
            .bind(&alarm.severity)
            .bind(&alarm.description)
            .bind(now)
            .bind(&alarm.event_id)
            .bind(&alarm.severity)
            .bind(&alarm.description)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        debug!("upserted {} alarm(s), {} new", alarms.len(), inserted);
        Ok(inserted)
    }

    async fn latest_alarm_timestamp(&self) -> StorageResult<Option<DateTime<Utc>>> {
        let (latest,): (Option<i64>,) = sqlx::query_as("SELECT MAX(occurred_at) FROM alarms")
            .fetch_one(&self.pool)
            .await?;

        Ok(latest.and_then(Self::millis_to_timestamp))
    }

    async fn count_alarms(&self) -> StorageResult<usize> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM alarms")
            .fetch_one(&self.pool)
            .await?;

        Ok(count as usize)
    }

    #[instrument(skip(self, devices), fields(count = devices.len()))]
    async fn upsert_devices(&self, devices: &[Device]) -> StorageResult<usize> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        for device in devices {
            sqlx::query(
                r#"
                INSERT INTO mcs_devices (uuid, label, ip, updated_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT (uuid) DO UPDATE SET
                    label = excluded.label,
                    ip = excluded.ip,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&device.uuid)
            .bind(&device.label)
            .bind(&device.ip)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(devices.len())
    }

    #[instrument(skip(self, statuses), fields(count = statuses.len()))]
    async fn update_device_statuses(&self, statuses: &[DeviceStatus]) -> StorageResult<usize> {
        let now = Utc::now().timestamp_millis();
        let mut updated = 0;
        let mut tx = self.pool.begin().await?;

        for status in statuses {
            let result =
                sqlx::query("UPDATE mcs_devices SET status = ?, updated_at = ? WHERE uuid = ?")
                    .bind(&status.status)
                    .bind(now)
                    .bind(&status.uuid)
                    .execute(&mut *tx)
                    .await?;
            updated += result.rows_affected() as usize;
        }

        tx.commit().await?;
        Ok(updated)
    }

    #[instrument(skip(self, outputs), fields(count = outputs.len()))]
    async fn upsert_outputs(&self, outputs: &[Output]) -> StorageResult<usize> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        for output in outputs {
            sqlx::query(
                r#"
                INSERT INTO mcs_outputs (uuid, label, device_uuid, updated_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT (uuid) DO UPDATE SET
                    label = excluded.label,
                    device_uuid = excluded.device_uuid,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&output.uuid)
            .bind(&output.label)
            .bind(&output.device_uuid)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(outputs.len())
    }

    #[instrument(skip(self, outputs), fields(count = outputs.len()))]
    async fn upsert_encoder_outputs(&self, outputs: &[EncoderOutput]) -> StorageResult<usize> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        for output in outputs {
            sqlx::query(
                r#"
                INSERT INTO mcs_encoder_outputs
                    (uuid, device_ip, encoder_uuid, encoder_id, label, enabled, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (uuid) DO UPDATE SET
                    encoder_uuid = excluded.encoder_uuid,
                    encoder_id = excluded.encoder_id,
                    label = excluded.label,
                    enabled = excluded.enabled,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&output.uuid)
            .bind(&output.device_ip)
            .bind(&output.encoder_uuid)
            .bind(&output.encoder_id)
            .bind(&output.label)
            .bind(output.enabled)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(outputs.len())
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> StorageResult<HealthStatus> {
        match sqlx::query("SELECT 1").fetch_one(&self.pool).await {
            Ok(_) => {
                let mut metadata = HashMap::new();
                metadata.insert("backend".to_string(), "sqlite".to_string());
                metadata.insert("db_path".to_string(), self.db_path.clone());

                Ok(HealthStatus {
                    healthy: true,
                    message: "SQLite backend operational".to_string(),
                    metadata,
                })
            }
            Err(e) => {
                warn!("health check failed: {}", e);
                Ok(HealthStatus {
                    healthy: false,
                    message: format!("health check failed: {}", e),
                    metadata: HashMap::new(),
                })
            }
        }
    }

    async fn close(&self) -> StorageResult<()> {
        info!("closing SQLite backend");
        self.pool.close().await;
        Ok(())
    }
}
