//! The polling/ingestion cycle
//!
//! One `CollectorLoop` iteration is: get a valid token, fetch alarms since the cursor,
//! upsert them, and only then move the cursor forward. Any step may fail; the failure is
//! reported in the iteration's `CycleReport` and the next iteration starts from the same
//! cursor. Every few iterations the device inventory is refreshed as well, including the
//! output lists of encoders that MCS reports as up.
//!
//! The loop itself does not sleep. Scheduling, shutdown and the sleep between iterations
//! belong to [`crate::actors::collector`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::mcs::{
    AlarmFetcher, AuthError, Credentials, EncoderClient, EndpointState, FetchError, Token,
    TokenManager, TokenStore, build_http_client,
};
use crate::{AlarmEvent, Device, DeviceStatus, EncoderOutput};
use crate::retry::RetryPolicy;
use crate::storage::{AlarmStore, StorageError};
use crate::time::Sleeper;

/// Lower bound for the next fetch
///
/// Holds the newest timestamp that has been durably stored. It is sent as an inclusive
/// `since`, so the newest stored alarm is fetched again next time and absorbed by the
/// upsert. It never moves backwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchCursor {
    since: Option<DateTime<Utc>>,
}

impl FetchCursor {
    pub fn new(since: Option<DateTime<Utc>>) -> Self {
        Self { since }
    }

    pub fn since(&self) -> Option<DateTime<Utc>> {
        self.since
    }

    /// Move past the given (already stored) events, returns whether the cursor moved
    pub fn advance(&mut self, stored: &[AlarmEvent]) -> bool {
        let newest = stored.iter().map(|event| event.timestamp).max();

        match (self.since, newest) {
            (_, None) => false,
            (Some(current), Some(newest)) if newest <= current => false,
            (_, Some(newest)) => {
                self.since = Some(newest);
                true
            }
        }
    }
}

/// Where in the cycle something went wrong
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleStep {
    Authenticate,
    Fetch,
    Store,
    Inventory,
}

impl fmt::Display for CycleStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CycleStep::Authenticate => "authenticate",
            CycleStep::Fetch => "fetch",
            CycleStep::Store => "store",
            CycleStep::Inventory => "inventory",
        };
        f.write_str(name)
    }
}

/// A failed step, caught at the loop boundary
#[derive(Debug)]
pub enum CycleError {
    Auth(AuthError),
    Fetch(FetchError),
    Storage(StorageError),
}

impl CycleError {
    pub fn step(&self) -> CycleStep {
        match self {
            CycleError::Auth(_) => CycleStep::Authenticate,
            CycleError::Fetch(_) => CycleStep::Fetch,
            CycleError::Storage(_) => CycleStep::Store,
        }
    }
}

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleError::Auth(e) => write!(f, "{}", e),
            CycleError::Fetch(e) => write!(f, "{}", e),
            CycleError::Storage(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for CycleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CycleError::Auth(e) => Some(e),
            CycleError::Fetch(e) => Some(e),
            CycleError::Storage(e) => Some(e),
        }
    }
}

impl From<AuthError> for CycleError {
    fn from(err: AuthError) -> Self {
        CycleError::Auth(err)
    }
}

impl From<FetchError> for CycleError {
    fn from(err: FetchError) -> Self {
        CycleError::Fetch(err)
    }
}

impl From<StorageError> for CycleError {
    fn from(err: StorageError) -> Self {
        CycleError::Storage(err)
    }
}

/// What a successful alarm cycle did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleSummary {
    pub fetched: usize,
    pub inserted: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InventorySummary {
    pub devices: usize,
    pub statuses: usize,
    pub outputs: usize,
    pub encoder_outputs: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed { fetched: usize, inserted: usize },
    Skipped { step: CycleStep, reason: String },
}

/// Result of one loop iteration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub iteration: u64,
    pub outcome: CycleOutcome,
    /// Present on iterations that also refreshed the inventory
    pub inventory: Option<Result<InventorySummary, String>>,
}

impl CycleReport {
    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, CycleOutcome::Completed { .. })
    }
}

/// Where the collector is in its life
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Starting,
    Polling,
    Sleeping,
    Stopping,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopState::Starting => "starting",
            LoopState::Polling => "polling",
            LoopState::Sleeping => "sleeping",
            LoopState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

pub struct CollectorLoop {
    tokens: TokenManager,
    fetcher: AlarmFetcher,
    store: AlarmStore,
    cursor: FetchCursor,
    iteration: u64,
    /// Refresh inventory every N iterations, 0 disables
    inventory_every: u64,
    encoders: Option<EncoderClient>,
    started: bool,
}

impl CollectorLoop {
    pub fn new(tokens: TokenManager, fetcher: AlarmFetcher, store: AlarmStore) -> Self {
        Self {
            tokens,
            fetcher,
            store,
            cursor: FetchCursor::default(),
            iteration: 0,
            inventory_every: 0,
            encoders: None,
            started: false,
        }
    }

    /// Wire up all components from the assembled configuration
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let tuning = &config.tuning;
        let primary = config.mcs.primary_url();
        let secondary = config.mcs.secondary_url();
        let connect_timeout = Duration::from_secs(tuning.fetch.connect_timeout_secs);

        let auth_http = build_http_client(
            Duration::from_secs(tuning.token.request_timeout_secs),
            connect_timeout,
            config.mcs.insecure_tls,
        )
        .context("failed to build HTTP client for MCS authentication")?;

        let fetch_http = build_http_client(
            Duration::from_secs(tuning.fetch.request_timeout_secs),
            connect_timeout,
            config.mcs.insecure_tls,
        )
        .context("failed to build HTTP client for MCS requests")?;

        let tokens = TokenManager::new(
            auth_http,
            vec![primary.clone(), secondary.clone()],
            Credentials::new(config.mcs.username.clone(), config.mcs.password.clone()),
            TokenStore::new(config.token_path.clone()),
        )
        .with_retry(RetryPolicy::from_config(&tuning.token.retry))
        .with_default_ttl(Duration::from_secs(tuning.token.default_ttl_secs))
        .with_safety_margin(Duration::from_secs(tuning.token.safety_margin_secs));

        let fetcher = AlarmFetcher::new(
            fetch_http,
            EndpointState::new(primary, secondary, tuning.fetch.failover_threshold),
        )
        .with_alarms_path(tuning.fetch.alarms_path.clone())
        .with_retry(RetryPolicy::from_config(&tuning.fetch.retry));

        let store = AlarmStore::from_config(config);

        let mut collector = Self::new(tokens, fetcher, store)
            .with_inventory_every(tuning.inventory.every_iterations);

        if let Some(encoders) = &config.encoders {
            let encoder_http = build_http_client(
                Duration::from_secs(tuning.inventory.encoder_timeout_secs),
                connect_timeout,
                config.mcs.insecure_tls,
            )
            .context("failed to build HTTP client for encoder requests")?;

            collector = collector.with_encoders(EncoderClient::new(
                encoder_http,
                Credentials::new(encoders.username.clone(), encoders.password.clone()),
                encoders.scheme.clone(),
            ));
        }

        Ok(collector)
    }

    pub fn with_inventory_every(mut self, every: u64) -> Self {
        self.inventory_every = every;
        self
    }

    /// Also read output lists from every encoder that is up during inventory sync
    pub fn with_encoders(mut self, encoders: EncoderClient) -> Self {
        self.encoders = Some(encoders);
        self
    }

    pub fn with_cursor(mut self, cursor: FetchCursor) -> Self {
        self.cursor = cursor;
        self
    }

    /// Give every component that waits the same sleeper
    pub fn with_sleeper(self, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            tokens: self.tokens.with_sleeper(sleeper.clone()),
            fetcher: self.fetcher.with_sleeper(sleeper.clone()),
            store: self.store.with_sleeper(sleeper),
            ..self
        }
    }

    pub fn cursor(&self) -> FetchCursor {
        self.cursor
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    pub fn fetcher(&self) -> &AlarmFetcher {
        &self.fetcher
    }

    pub fn store(&mut self) -> &mut AlarmStore {
        &mut self.store
    }

    /// Restore the persisted token and seed the cursor from storage
    ///
    /// Neither is required: without a usable token the first cycle logs in, and an
    /// unreachable database leaves the cursor empty until the first successful store.
    #[instrument(skip(self))]
    pub async fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;

        if !self.tokens.restore() {
            debug!("no usable persisted token, will authenticate on first cycle");
        }

        if self.cursor.since().is_some() {
            return;
        }

        match self.store.latest_alarm_timestamp().await {
            Ok(Some(latest)) => {
                info!("resuming after newest stored alarm at {}", latest);
                self.cursor = FetchCursor::new(Some(latest));
            }
            Ok(None) => debug!("no alarms stored yet, first fetch is unbounded"),
            Err(e) => warn!("could not read newest stored alarm, starting unbounded: {}", e),
        }
    }

    /// One authenticate/fetch/store pass
    ///
    /// A rejected token gets one forced refresh and one more fetch within the same call.
    /// The cursor only moves once the store reports success.
    pub async fn poll_once(&mut self) -> Result<CycleSummary, CycleError> {
        let token = self.tokens.get_valid_token().await?;
        let events = self.fetch_with_reauth(token).await?;

        let inserted = self.store.upsert(&events).await?;

        if self.cursor.advance(&events) {
            debug!("cursor advanced to {:?}", self.cursor.since());
        }

        Ok(CycleSummary {
            fetched: events.len(),
            inserted,
        })
    }

    async fn fetch_with_reauth(&mut self, token: Token) -> Result<Vec<AlarmEvent>, CycleError> {
        let since = self.cursor.since();

        match self.fetcher.fetch(&token, since).await {
            Err(FetchError::AuthExpired { endpoint }) => {
                warn!("{} rejected the access token, refreshing", endpoint);
                let token = self.tokens.force_refresh().await?;
                Ok(self.fetcher.fetch(&token, since).await?)
            }
            other => Ok(other?),
        }
    }

    /// Refresh devices, device status and outputs
    #[instrument(skip(self))]
    pub async fn sync_inventory(&mut self) -> Result<InventorySummary, CycleError> {
        let token = self.tokens.get_valid_token().await?;

        let devices = self.fetcher.fetch_devices(&token).await?;
        let statuses = self.fetcher.fetch_device_status(&token).await?;
        let outputs = self.fetcher.fetch_outputs(&token).await?;

        let encoder_outputs = self.fetch_encoder_outputs(&devices, &statuses).await;

        let summary = InventorySummary {
            devices: self.store.upsert_devices(&devices).await?,
            statuses: self.store.update_device_statuses(&statuses).await?,
            outputs: self.store.upsert_outputs(&outputs).await?,
            encoder_outputs: self.store.upsert_encoder_outputs(&encoder_outputs).await?,
        };

        debug!(
            "inventory: {} device(s), {} status update(s), {} output(s), {} encoder output(s)",
            summary.devices, summary.statuses, summary.outputs, summary.encoder_outputs
        );
        Ok(summary)
    }

    /// Outputs of every device that is up and has an address
    ///
    /// An unreachable encoder is logged and left out; the others are still collected.
    async fn fetch_encoder_outputs(
        &self,
        devices: &[Device],
        statuses: &[DeviceStatus],
    ) -> Vec<EncoderOutput> {
        let Some(encoders) = &self.encoders else {
            return Vec::new();
        };

        let is_up = |uuid: &str| {
            statuses
                .iter()
                .any(|s| s.uuid == uuid && s.status.as_deref() == Some("Up"))
        };

        let mut collected = Vec::new();
        for device in devices.iter().filter(|device| is_up(&device.uuid)) {
            let Some(ip) = device.ip.as_deref().filter(|ip| !ip.trim().is_empty()) else {
                continue;
            };

            match encoders.fetch_outputs(ip).await {
                Ok(outputs) => collected.extend(outputs),
                Err(e) => warn!("skipping encoder {} ({}): {}", device.uuid, ip, e),
            }
        }
        collected
    }

    fn inventory_due(&self) -> bool {
        self.inventory_every > 0 && (self.iteration - 1) % self.inventory_every == 0
    }

    /// Run one full iteration and report what happened
    ///
    /// Never fails: every component error ends up in the report.
    pub async fn run_iteration(&mut self) -> CycleReport {
        self.start().await;
        self.iteration += 1;
        let n = self.iteration;

        let outcome = match self.poll_once().await {
            Ok(summary) => {
                info!(
                    "iteration {}: fetched {} alarm(s), {} new",
                    n, summary.fetched, summary.inserted
                );
                CycleOutcome::Completed {
                    fetched: summary.fetched,
                    inserted: summary.inserted,
                }
            }
            Err(e) => {
                warn!("iteration {}: {} step failed: {}", n, e.step(), e);
                CycleOutcome::Skipped {
                    step: e.step(),
                    reason: e.to_string(),
                }
            }
        };

        let auth_failed = matches!(
            outcome,
            CycleOutcome::Skipped {
                step: CycleStep::Authenticate,
                ..
            }
        );

        let inventory = if self.inventory_due() && !auth_failed {
            Some(self.sync_inventory().await.map_err(|e| {
                warn!("iteration {}: inventory sync failed: {}", n, e);
                e.to_string()
            }))
        } else {
            None
        };

        CycleReport {
            iteration: n,
            outcome,
            inventory,
        }
    }

    /// Release the database connection
    pub async fn shutdown(&mut self) {
        self.store.close().await;
    }
}
