//! Test helpers for the collector integration tests
//!
//! - `FakeMcs`: wiremock responder serving a growing alarm feed that honors `since`
//! - `Database`: storage connector whose database can be switched off and on
//! - `GatedSleeper`: a sleeper that only returns when the test lets it

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, SecondsFormat, Utc};
use mcs_collector::actors::CollectorHandle;
use mcs_collector::ingest::CollectorLoop;
use mcs_collector::mcs::{
    AlarmFetcher, Credentials, EndpointState, LOGIN_PATH, TokenManager, TokenStore,
};
use mcs_collector::retry::RetryPolicy;
use mcs_collector::storage::{
    AlarmStore, BackendConnector, HealthStatus, MemoryBackend, StorageBackend, StorageError,
    StorageResult,
};
use mcs_collector::time::Sleeper;
use mcs_collector::{AlarmEvent, Device, DeviceStatus, EncoderOutput, Output};
use tokio::sync::Semaphore;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

pub const ALARMS_PATH: &str = "/api/5.1/alarms";

/// Unsigned JWT carrying only an `exp` claim
pub fn jwt(exp: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let claims = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{exp}}}"#));
    format!("{header}.{claims}.")
}

pub fn ts(rfc3339: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(rfc3339)
        .unwrap()
        .with_timezone(&Utc)
}

/// Login answering with an opaque token and the given lifetime
pub async fn mount_login(server: &MockServer, access_token: &str, expires_in: i64) {
    Mock::given(method("POST"))
        .and(path(LOGIN_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": {"access_token": access_token, "expires_in": expires_in}
        })))
        .mount(server)
        .await;
}

/// Alarm list that grows during a test and answers `since` like MCS does
#[derive(Clone, Default)]
pub struct FakeMcs {
    alarms: Arc<Mutex<Vec<(String, DateTime<Utc>)>>>,
    seen_since: Arc<Mutex<Vec<Option<String>>>>,
}

impl FakeMcs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self, id: &str, at: DateTime<Utc>) {
        self.alarms.lock().unwrap().push((id.to_string(), at));
    }

    /// The `since` parameter of every alarm request so far
    pub fn seen_since(&self) -> Vec<Option<String>> {
        self.seen_since.lock().unwrap().clone()
    }

    pub async fn mount(&self, server: &MockServer) {
        Mock::given(method("GET"))
            .and(path(ALARMS_PATH))
            .respond_with(self.clone())
            .mount(server)
            .await;
    }
}

impl Respond for FakeMcs {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let since = request
            .url
            .query_pairs()
            .find(|(key, _)| key == "since")
            .map(|(_, value)| value.to_string());
        self.seen_since.lock().unwrap().push(since.clone());

        let lower = since.as_deref().map(ts);
        let data: Vec<_> = self
            .alarms
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, at)| lower.is_none_or(|lower| *at >= lower))
            .map(|(id, at)| {
                serde_json::json!({
                    "id": id,
                    "timestamp": at.to_rfc3339_opts(SecondsFormat::Secs, true),
                    "severity": "major",
                    "description": format!("alarm {id}"),
                })
            })
            .collect();

        ResponseTemplate::new(200).set_body_json(serde_json::json!({ "data": data }))
    }
}

/// A database that can be taken offline
///
/// Rows live in one shared `MemoryBackend`, so they survive reconnects.
#[derive(Clone, Default)]
pub struct Database {
    pub rows: Arc<MemoryBackend>,
    down: Arc<AtomicBool>,
    connects: Arc<AtomicUsize>,
}

impl Database {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn connector(&self) -> Arc<dyn BackendConnector> {
        Arc::new(self.clone())
    }
}

#[async_trait]
impl BackendConnector for Database {
    async fn connect(&self) -> StorageResult<Arc<dyn StorageBackend>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(StorageError::ConnectionFailed(
                "connection refused".to_string(),
            ));
        }
        Ok(Arc::new(Connection {
            rows: self.rows.clone(),
            down: self.down.clone(),
        }))
    }

    fn describe(&self) -> String {
        "test database".to_string()
    }
}

struct Connection {
    rows: Arc<MemoryBackend>,
    down: Arc<AtomicBool>,
}

impl Connection {
    fn check(&self) -> StorageResult<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StorageError::ConnectionFailed(
                "server closed the connection".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for Connection {
    async fn upsert_alarms(&self, alarms: &[AlarmEvent]) -> StorageResult<usize> {
        self.check()?;
        self.rows.upsert_alarms(alarms).await
    }

    async fn latest_alarm_timestamp(&self) -> StorageResult<Option<DateTime<Utc>>> {
        self.check()?;
        self.rows.latest_alarm_timestamp().await
    }

    async fn count_alarms(&self) -> StorageResult<usize> {
        self.check()?;
        self.rows.count_alarms().await
    }

    async fn upsert_devices(&self, devices: &[Device]) -> StorageResult<usize> {
        self.check()?;
        self.rows.upsert_devices(devices).await
    }

    async fn update_device_statuses(&self, statuses: &[DeviceStatus]) -> StorageResult<usize> {
        self.check()?;
        self.rows.update_device_statuses(statuses).await
    }

    async fn upsert_outputs(&self, outputs: &[Output]) -> StorageResult<usize> {
        self.check()?;
        self.rows.upsert_outputs(outputs).await
    }

    async fn upsert_encoder_outputs(&self, outputs: &[EncoderOutput]) -> StorageResult<usize> {
        self.check()?;
        self.rows.upsert_encoder_outputs(outputs).await
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        self.check()?;
        self.rows.health_check().await
    }

    async fn close(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Records requested delays and blocks until `release` is called
pub struct GatedSleeper {
    delays: Mutex<Vec<Duration>>,
    gate: Semaphore,
}

impl GatedSleeper {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            delays: Mutex::new(Vec::new()),
            gate: Semaphore::new(0),
        })
    }

    pub fn release(&self) {
        self.gate.add_permits(1);
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sleeper for GatedSleeper {
    async fn sleep(&self, duration: Duration) {
        self.delays.lock().unwrap().push(duration);
        if let Ok(permit) = self.gate.acquire().await {
            permit.forget();
        }
    }
}

/// Collector against the given MCS host(s), with no retries and no backoff
pub fn collector(
    primary: &str,
    secondary: &str,
    token_path: std::path::PathBuf,
    connector: Arc<dyn BackendConnector>,
) -> CollectorLoop {
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap();

    let tokens = TokenManager::new(
        http.clone(),
        vec![primary.to_string(), secondary.to_string()],
        Credentials::new("collector", "hunter2"),
        TokenStore::new(token_path),
    )
    .with_retry(RetryPolicy::once());

    let fetcher = AlarmFetcher::new(http, EndpointState::new(primary, secondary, 3));

    CollectorLoop::new(tokens, fetcher, AlarmStore::new(connector))
}

/// Ask for status until the collector has finished `n` iterations
pub async fn wait_for_iteration(handle: &CollectorHandle, n: u64) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if handle.status().await.unwrap().iteration >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("collector did not reach the expected iteration");
}
