//! PostgreSQL storage backend
//!
//! The network database for production deployments. Same tables as the SQLite backend,
//! with native `TIMESTAMPTZ` and `JSONB` columns.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Pool, Postgres};
use tracing::{debug, info, instrument, warn};

use super::backend::{HealthStatus, StorageBackend};
use super::error::{StorageError, StorageResult};
use crate::config::PostgresConfig;
use crate::{AlarmEvent, Device, DeviceStatus, EncoderOutput, Output};

#[derive(Debug)]
pub struct PostgresBackend {
    pool: Pool<Postgres>,
    target: String,
}

impl PostgresBackend {
    /// Connect and run migrations
    ///
    /// `acquire_timeout` bounds both the initial connect and every later pool checkout.
    #[instrument(skip_all, fields(host = %config.host, database = %config.database))]
    pub async fn connect(
        config: &PostgresConfig,
        acquire_timeout: Duration,
    ) -> StorageResult<Self> {
        let password = config
            .password
            .as_deref()
            .ok_or_else(|| StorageError::InvalidConfig("SQL_PASSWORD is not set".to_string()))?;

        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.database)
            .username(&config.username)
            .password(password)
            .application_name("mcs-collector");

        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(acquire_timeout)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        debug!("running database migrations");
        sqlx::migrate!("./migrations/postgres").run(&pool).await?;

        let target = format!("{}:{}/{}", config.host, config.port, config.database);
        info!("PostgreSQL backend ready ({})", target);

        Ok(Self { pool, target })
    }
}

#[async_trait]
impl StorageBackend for PostgresBackend {
    #[instrument(skip(self, alarms), fields(count = alarms.len()))]
    async fn upsert_alarms(&self, alarms: &[AlarmEvent]) -> StorageResult<usize> {
        if alarms.is_empty() {
            return Ok(0);
        }

        let mut inserted = 0;
        let mut tx = self.pool.begin().await?;

        for alarm in alarms {
            let result = sqlx::query(
                r#"
                INSERT INTO alarms (event_id, occurred_at, severity, description, raw_payload)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (event_id) DO NOTHING
                "#,
            )
            .bind(&alarm.event_id)
            .bind(alarm.timestamp)
            .bind(&alarm.severity)
            .bind(&alarm.description)
            .bind(Json(&alarm.raw_payload))
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 1 {
                inserted += 1;
                continue;
            }

            sqlx::query(
                r#"
                UPDATE alarms
                SET severity = $2, description = $3, last_updated = now()
                WHERE event_id = $1 AND (severity <> $2 OR description <> $3)
                "#,
            )
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
        let (latest,): (Option<DateTime<Utc>>,) =
            sqlx::query_as("SELECT MAX(occurred_at) FROM alarms")
                .fetch_one(&self.pool)
                .await?;

        Ok(latest)
    }

    async fn count_alarms(&self) -> StorageResult<usize> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM alarms")
            .fetch_one(&self.pool)
            .await?;

        Ok(count as usize)
    }

    #[instrument(skip(self, devices), fields(count = devices.len()))]
    async fn upsert_devices(&self, devices: &[Device]) -> StorageResult<usize> {
        let mut tx = self.pool.begin().await?;

        for device in devices {
            sqlx::query(
                r#"
                INSERT INTO mcs_devices (uuid, label, ip, updated_at)
                VALUES ($1, $2, $3, now())
                ON CONFLICT (uuid) DO UPDATE SET
                    label = EXCLUDED.label,
                    ip = EXCLUDED.ip,
                    updated_at = now()
                "#,
            )
            .bind(&device.uuid)
            .bind(&device.label)
            .bind(&device.ip)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(devices.len())
    }

    #[instrument(skip(self, statuses), fields(count = statuses.len()))]
    async fn update_device_statuses(&self, statuses: &[DeviceStatus]) -> StorageResult<usize> {
        let mut updated = 0;
        let mut tx = self.pool.begin().await?;

        for status in statuses {
            let result = sqlx::query(
                "UPDATE mcs_devices SET status = $2, updated_at = now() WHERE uuid = $1",
            )
            .bind(&status.uuid)
            .bind(&status.status)
            .execute(&mut *tx)
            .await?;
            updated += result.rows_affected() as usize;
        }

        tx.commit().await?;
        Ok(updated)
    }

    #[instrument(skip(self, outputs), fields(count = outputs.len()))]
    async fn upsert_outputs(&self, outputs: &[Output]) -> StorageResult<usize> {
        let mut tx = self.pool.begin().await?;

        for output in outputs {
            sqlx::query(
                r#"
                INSERT INTO mcs_outputs (uuid, label, device_uuid, updated_at)
                VALUES ($1, $2, $3, now())
                ON CONFLICT (uuid) DO UPDATE SET
                    label = EXCLUDED.label,
                    device_uuid = EXCLUDED.device_uuid,
                    updated_at = now()
                "#,
            )
            .bind(&output.uuid)
            .bind(&output.label)
            .bind(&output.device_uuid)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(outputs.len())
    }

    #[instrument(skip(self, outputs), fields(count = outputs.len()))]
    async fn upsert_encoder_outputs(&self, outputs: &[EncoderOutput]) -> StorageResult<usize> {
        let mut tx = self.pool.begin().await?;

        for output in outputs {
            sqlx::query(
                r#"
                INSERT INTO mcs_encoder_outputs
                    (uuid, device_ip, encoder_uuid, encoder_id, label, enabled, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, now())
                ON CONFLICT (uuid) DO UPDATE SET
                    encoder_uuid = EXCLUDED.encoder_uuid,
                    encoder_id = EXCLUDED.encoder_id,
                    label = EXCLUDED.label,
                    enabled = EXCLUDED.enabled,
                    updated_at = now()
                "#,
            )
            .bind(&output.uuid)
            .bind(&output.device_ip)
            .bind(&output.encoder_uuid)
            .bind(&output.encoder_id)
            .bind(&output.label)
            .bind(output.enabled)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(outputs.len())
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> StorageResult<HealthStatus> {
        match sqlx::query("SELECT 1").fetch_one(&self.pool).await {
            Ok(_) => Ok(HealthStatus {
                healthy: true,
                message: "PostgreSQL backend operational".to_string(),
                metadata: HashMap::from([
                    ("backend".to_string(), "postgres".to_string()),
                    ("target".to_string(), self.target.clone()),
                ]),
            }),
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
        info!("closing PostgreSQL backend");
        self.pool.close().await;
        Ok(())
    }
}
