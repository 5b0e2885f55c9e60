//! AlarmStore - lazily connected, self-healing front for a `StorageBackend`
//!
//! The backend is opened on first use and kept across cycles. When a call fails with a
//! connection-class error the backend is dropped, a fresh one is opened and the call is
//! retried exactly once. Every call is bounded by the operation timeout; a timeout counts
//! as a connection failure.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use super::backend::{BackendConnector, HealthStatus, StorageBackend};
use super::error::{StorageError, StorageResult};
use super::memory::MemoryBackend;
use super::sqlite::SqliteBackend;
use crate::config::{Config, StorageConfig};
use crate::retry::RetryPolicy;
use crate::time::{Sleeper, TokioSleeper};
use crate::{AlarmEvent, Device, DeviceStatus, EncoderOutput, Output};

/// Opens the backend named by `StorageConfig`
///
/// The in-memory backend is created once and handed out again on reconnect, so a
/// reconnect never loses what was stored.
pub struct ConfigConnector {
    config: StorageConfig,
    acquire_timeout: Duration,
    memory: Arc<MemoryBackend>,
}

impl ConfigConnector {
    pub fn new(config: StorageConfig, acquire_timeout: Duration) -> Self {
        Self {
            config,
            acquire_timeout,
            memory: Arc::new(MemoryBackend::new()),
        }
    }

    pub fn memory_backend(&self) -> Arc<MemoryBackend> {
        self.memory.clone()
    }
}

#[async_trait]
impl BackendConnector for ConfigConnector {
    async fn connect(&self) -> StorageResult<Arc<dyn StorageBackend>> {
        match &self.config {
            StorageConfig::None => Ok(self.memory.clone()),
            StorageConfig::Sqlite { path } => Ok(Arc::new(SqliteBackend::new(path).await?)),
            #[cfg(feature = "storage-postgres")]
            StorageConfig::Postgres(pg) => Ok(Arc::new(
                super::postgres::PostgresBackend::connect(pg, self.acquire_timeout).await?,
            )),
            #[cfg(not(feature = "storage-postgres"))]
            StorageConfig::Postgres(_) => Err(StorageError::InvalidConfig(
                "built without the storage-postgres feature".to_string(),
            )),
        }
    }

    fn describe(&self) -> String {
        match &self.config {
            StorageConfig::None => "in-memory".to_string(),
            StorageConfig::Sqlite { path } => format!("sqlite:{}", path.display()),
            StorageConfig::Postgres(pg) => {
                format!("postgres://{}@{}:{}/{}", pg.username, pg.host, pg.port, pg.database)
            }
        }
    }
}

pub struct AlarmStore {
    connector: Arc<dyn BackendConnector>,
    backend: Option<Arc<dyn StorageBackend>>,
    connect_retry: RetryPolicy,
    operation_timeout: Duration,
    sleeper: Arc<dyn Sleeper>,
}

impl AlarmStore {
    pub fn new(connector: Arc<dyn BackendConnector>) -> Self {
        Self {
            connector,
            backend: None,
            connect_retry: RetryPolicy::once(),
            operation_timeout: Duration::from_secs(30),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let tuning = &config.tuning.storage;
        let timeout = Duration::from_secs(tuning.operation_timeout_secs);

        Self::new(Arc::new(ConfigConnector::new(config.storage.clone(), timeout)))
            .with_connect_retry(RetryPolicy::from_config(&tuning.connect_retry))
            .with_operation_timeout(timeout)
    }

    pub fn with_connect_retry(mut self, retry: RetryPolicy) -> Self {
        self.connect_retry = retry;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.backend.is_some()
    }

    /// Insert new alarms, refresh mutable fields of known ones
    ///
    /// Returns the number of newly inserted rows. An empty batch returns 0 without
    /// touching (or connecting to) the database.
    #[instrument(skip(self, events), fields(count = events.len()))]
    pub async fn upsert(&mut self, events: &[AlarmEvent]) -> StorageResult<usize> {
        if events.is_empty() {
            return Ok(0);
        }

        self.with_reconnect("upsert alarms", move |backend| async move {
            backend.upsert_alarms(events).await
        })
        .await
    }

    pub async fn latest_alarm_timestamp(&mut self) -> StorageResult<Option<DateTime<Utc>>> {
        self.with_reconnect("latest alarm timestamp", |backend| async move {
            backend.latest_alarm_timestamp().await
        })
        .await
    }

    pub async fn count_alarms(&mut self) -> StorageResult<usize> {
        self.with_reconnect("count alarms", |backend| async move {
            backend.count_alarms().await
        })
        .await
    }

    pub async fn upsert_devices(&mut self, devices: &[Device]) -> StorageResult<usize> {
        if devices.is_empty() {
            return Ok(0);
        }

        self.with_reconnect("upsert devices", move |backend| async move {
            backend.upsert_devices(devices).await
        })
        .await
    }

    pub async fn update_device_statuses(
        &mut self,
        statuses: &[DeviceStatus],
    ) -> StorageResult<usize> {
        if statuses.is_empty() {
            return Ok(0);
        }

        self.with_reconnect("update device statuses", move |backend| async move {
            backend.update_device_statuses(statuses).await
        })
        .await
    }

    pub async fn upsert_outputs(&mut self, outputs: &[Output]) -> StorageResult<usize> {
        if outputs.is_empty() {
            return Ok(0);
        }

        self.with_reconnect("upsert outputs", move |backend| async move {
            backend.upsert_outputs(outputs).await
        })
        .await
    }

    pub async fn upsert_encoder_outputs(
        &mut self,
        outputs: &[EncoderOutput],
    ) -> StorageResult<usize> {
        if outputs.is_empty() {
            return Ok(0);
        }

        self.with_reconnect("upsert encoder outputs", move |backend| async move {
            backend.upsert_encoder_outputs(outputs).await
        })
        .await
    }

    pub async fn health_check(&mut self) -> StorageResult<HealthStatus> {
        self.with_reconnect("health check", |backend| async move {
            backend.health_check().await
        })
        .await
    }

    /// Close the backend if one is open
    pub async fn close(&mut self) {
        self.disconnect().await;
    }

    async fn backend(&mut self) -> StorageResult<Arc<dyn StorageBackend>> {
        if let Some(backend) = &self.backend {
            return Ok(backend.clone());
        }

        let backend = self.connect().await?;
        self.backend = Some(backend.clone());
        Ok(backend)
    }

    async fn connect(&self) -> StorageResult<Arc<dyn StorageBackend>> {
        let target = self.connector.describe();
        let attempts = self.connect_retry.attempts();
        let mut attempt = 1;

        loop {
            debug!("connecting to {} (attempt {}/{})", target, attempt, attempts);

            let connecting = self.connector.connect();
            let result = match tokio::time::timeout(self.operation_timeout, connecting).await {
                Ok(result) => result,
                Err(_) => Err(StorageError::ConnectionFailed(format!(
                    "connecting to {} timed out after {:?}",
                    target, self.operation_timeout
                ))),
            };

            match result {
                Ok(backend) => {
                    info!("connected to {}", target);
                    return Ok(backend);
                }
                Err(e) if e.is_connection_error() && attempt < attempts => {
                    warn!("connection to {} failed: {}", target, e);
                    self.sleeper.sleep(self.connect_retry.backoff(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Some(backend) = self.backend.take() {
            match tokio::time::timeout(self.operation_timeout, backend.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("error while closing backend: {}", e),
                Err(_) => debug!("closing backend timed out"),
            }
        }
    }

    async fn bounded<T>(
        &self,
        op: &str,
        call: impl Future<Output = StorageResult<T>>,
    ) -> StorageResult<T> {
        match tokio::time::timeout(self.operation_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::ConnectionFailed(format!(
                "{} timed out after {:?}",
                op, self.operation_timeout
            ))),
        }
    }

    /// Run `call`, and on a connection failure reconnect and run it once more
    async fn with_reconnect<T, F, Fut>(&mut self, op: &str, call: F) -> StorageResult<T>
    where
        F: Fn(Arc<dyn StorageBackend>) -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let backend = self.backend().await?;

        match self.bounded(op, call(backend)).await {
            Err(e) if e.is_connection_error() => {
                warn!("{} failed, reconnecting: {}", op, e);
                self.disconnect().await;

                let backend = self.backend().await?;
                let result = self.bounded(op, call(backend)).await;

                if let Err(e) = &result {
                    if e.is_connection_error() {
                        self.disconnect().await;
                    }
                }
                result
            }
            other => other,
        }
    }
}
