//! AlarmFetcher - authenticated reads against the active MCS host

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::StatusCode;
use reqwest::header::ACCEPT;
use tracing::{debug, instrument, trace, warn};

use super::endpoint::EndpointState;
use super::error::FetchError;
use super::token::Token;
use super::{DEVICE_STATUS_PATH, DEVICES_PATH, OUTPUTS_PATH, wire};
use crate::retry::RetryPolicy;
use crate::time::{Sleeper, TokioSleeper};
use crate::{AlarmEvent, Device, DeviceStatus, Output};

pub struct AlarmFetcher {
    /// HTTP client (reused across requests)
    http: reqwest::Client,

    /// Primary/secondary choice, kept for the lifetime of the run
    endpoints: EndpointState,

    alarms_path: String,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl AlarmFetcher {
    pub fn new(http: reqwest::Client, endpoints: EndpointState) -> Self {
        Self {
            http,
            endpoints,
            alarms_path: "/api/5.1/alarms".to_string(),
            retry: RetryPolicy::once(),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_alarms_path(mut self, path: impl Into<String>) -> Self {
        self.alarms_path = path.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn endpoints(&self) -> &EndpointState {
        &self.endpoints
    }

    /// Fetch alarms, optionally only those at or after `since`
    ///
    /// Returns them in the order MCS sent them; an empty list when there is nothing new.
    #[instrument(skip(self, token), fields(endpoint = %self.endpoints.active()))]
    pub async fn fetch(
        &mut self,
        token: &Token,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<AlarmEvent>, FetchError> {
        let query: Vec<(&str, String)> = since
            .map(|ts| vec![("since", ts.to_rfc3339_opts(SecondsFormat::Millis, true))])
            .unwrap_or_default();

        let path = self.alarms_path.clone();
        let body = self.get(&path, token, &query).await?;
        let alarms = wire::parse_alarms(body.as_deref())?;

        debug!("received {} alarm(s)", alarms.len());
        Ok(alarms)
    }

    #[instrument(skip(self, token))]
    pub async fn fetch_devices(&mut self, token: &Token) -> Result<Vec<Device>, FetchError> {
        let body = self.get(DEVICES_PATH, token, &[]).await?;
        wire::parse_devices(body.as_deref())
    }

    #[instrument(skip(self, token))]
    pub async fn fetch_device_status(
        &mut self,
        token: &Token,
    ) -> Result<Vec<DeviceStatus>, FetchError> {
        let body = self.get(DEVICE_STATUS_PATH, token, &[]).await?;
        wire::parse_device_statuses(body.as_deref())
    }

    #[instrument(skip(self, token))]
    pub async fn fetch_outputs(&mut self, token: &Token) -> Result<Vec<Output>, FetchError> {
        let body = self.get(OUTPUTS_PATH, token, &[]).await?;
        wire::parse_outputs(body.as_deref())
    }

    /// GET against the active host, with failover bookkeeping
    ///
    /// Only transient failures count against a host. A 401 says something about the
    /// token, a malformed body about the payload; neither means the host is down.
    async fn get(
        &mut self,
        path: &str,
        token: &Token,
        query: &[(&str, String)],
    ) -> Result<Option<String>, FetchError> {
        let attempts = self.retry.attempts();
        let mut attempt = 1;

        loop {
            let base = self.endpoints.active_url().to_string();

            match self.get_once(&base, path, token, query).await {
                Ok(body) => {
                    self.endpoints.record_success();
                    return Ok(body);
                }
                Err(FetchError::Transient(msg)) => {
                    warn!("request to {base}{path} failed: {msg}");
                    self.endpoints.record_failure();

                    if attempt >= attempts {
                        return Err(FetchError::Transient(msg));
                    }
                    self.sleeper.sleep(self.retry.backoff(attempt)).await;
                    attempt += 1;
                }
                Err(other) => return Err(other),
            }
        }
    }

    async fn get_once(
        &self,
        base: &str,
        path: &str,
        token: &Token,
        query: &[(&str, String)],
    ) -> Result<Option<String>, FetchError> {
        let url = format!("{base}{path}");
        trace!("GET {url}");

        let response = self
            .http
            .get(&url)
            .bearer_auth(&token.value)
            .header(ACCEPT, "application/json")
            .query(query)
            .send()
            .await
            .map_err(|e| FetchError::Transient(format!("{url}: {e}")))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(FetchError::AuthExpired {
                endpoint: base.to_string(),
            });
        }
        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(FetchError::Transient(format!("{url}: HTTP {status}")));
        }

        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Transient(format!("{url}: failed to read body: {e}")))?;

        Ok(Some(body))
    }
}
