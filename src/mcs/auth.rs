//! TokenManager - owns the MCS access token
//!
//! ## Renewal
//!
//! ```text
//! get_valid_token ─ valid? ──yes──> current token
//!                      │no
//!                      ▼
//!                  refresh ── for each attempt (retry policy):
//!                               for host in [primary, secondary]:
//!                                 refresh token held? → POST /auth/token/refresh
//!                                 otherwise / rejected → POST /auth/login
//! ```
//!
//! A 401/403 on the login call ends the refresh immediately: the credentials are wrong
//! and hammering MCS will not fix them. Every successful renewal is written to the token
//! file before it is returned; a failed renewal never touches the file.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use reqwest::StatusCode;
use reqwest::header::ACCEPT;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use super::error::AuthError;
use super::token::{Token, TokenStore, jwt_expiry};
use super::{LOGIN_PATH, REFRESH_PATH};
use crate::retry::RetryPolicy;
use crate::time::{Clock, Sleeper, SystemClock, TokioSleeper};

/// Longest lifetime believed from a server, a JWT or the configuration
const MAX_TTL: TimeDelta = TimeDelta::days(365);

/// Username/password pair for the MCS login
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct AuthData {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AuthResponse {
    Wrapped { data: AuthData },
    Bare(AuthData),
}

impl AuthResponse {
    fn into_data(self) -> AuthData {
        match self {
            AuthResponse::Wrapped { data } => data,
            AuthResponse::Bare(data) => data,
        }
    }
}

/// Outcome of a single POST to an auth endpoint
enum CallError {
    Status(StatusCode),
    /// No HTTP exchange took place
    Unreachable(String),
    /// The host answered, but not with a usable token
    Failed(String),
}

/// Outcome of one pass over both hosts
enum AttemptError {
    Rejected { status: StatusCode, endpoint: String },
    Failed(String),
}

pub struct TokenManager {
    http: reqwest::Client,
    endpoints: Vec<String>,
    credentials: Credentials,
    store: TokenStore,
    retry: RetryPolicy,
    default_ttl: chrono::Duration,
    safety_margin: chrono::Duration,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,

    current: Option<Token>,
    /// Survives a failed renewal so the next one can still try the refresh call
    refresh_token: Option<String>,
}

impl TokenManager {
    /// Create a manager for the given hosts (tried in order)
    pub fn new(
        http: reqwest::Client,
        endpoints: Vec<String>,
        credentials: Credentials,
        store: TokenStore,
    ) -> Self {
        Self {
            http,
            endpoints,
            credentials,
            store,
            retry: RetryPolicy::default(),
            default_ttl: chrono::Duration::hours(1),
            safety_margin: chrono::Duration::seconds(60),
            clock: Arc::new(SystemClock),
            sleeper: Arc::new(TokioSleeper),
            current: None,
            refresh_token: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = to_chrono(ttl);
        self
    }

    pub fn with_safety_margin(mut self, margin: Duration) -> Self {
        self.safety_margin = to_chrono(margin);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn current(&self) -> Option<&Token> {
        self.current.as_ref()
    }

    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    /// Read the persisted token, if it is still usable
    ///
    /// Missing, corrupt and expired files all yield `None`.
    pub fn load_persisted(&self) -> Option<Token> {
        match self.store.load() {
            Ok(Some(token)) if token.is_valid_at(self.clock.now(), self.safety_margin) => {
                Some(token)
            }
            Ok(Some(token)) => {
                debug!(
                    "persisted token expired at {}, ignoring it",
                    token.expires_at
                );
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!(
                    "ignoring unusable token file {}: {e}",
                    self.store.path().display()
                );
                None
            }
        }
    }

    /// Adopt the persisted token at startup, returns whether one was usable
    pub fn restore(&mut self) -> bool {
        match self.load_persisted() {
            Some(token) => {
                info!(
                    "restored persisted access token (valid until {})",
                    token.expires_at
                );
                self.refresh_token = token.refresh_token.clone();
                self.current = Some(token);
                true
            }
            None => false,
        }
    }

    /// Current token if it is still valid, otherwise a freshly renewed one
    pub async fn get_valid_token(&mut self) -> Result<Token, AuthError> {
        let now = self.clock.now();
        if let Some(token) = &self.current {
            if token.is_valid_at(now, self.safety_margin) {
                return Ok(token.clone());
            }
        }

        debug!("no valid access token, renewing");
        self.refresh().await
    }

    /// Drop the in-memory token (MCS rejected it) and renew right away
    pub async fn force_refresh(&mut self) -> Result<Token, AuthError> {
        self.current = None;
        self.refresh().await
    }

    #[instrument(skip(self))]
    pub async fn refresh(&mut self) -> Result<Token, AuthError> {
        let attempts = self.retry.attempts();
        let mut last_error = String::from("no MCS endpoint configured");

        for attempt in 1..=attempts {
            match self.authenticate_once().await {
                Ok(token) => {
                    info!(
                        "obtained access token valid until {} (ttl {}s)",
                        token.expires_at,
                        token.ttl().num_seconds()
                    );
                    self.persist(&token);
                    self.refresh_token = token.refresh_token.clone();
                    self.current = Some(token.clone());
                    return Ok(token);
                }
                Err(AttemptError::Rejected { status, endpoint }) => {
                    error!("MCS at {endpoint} rejected the configured credentials ({status})");
                    self.current = None;
                    return Err(AuthError::Credentials {
                        status: status.as_u16(),
                        endpoint,
                    });
                }
                Err(AttemptError::Failed(msg)) => {
                    warn!("authentication attempt {attempt}/{attempts} failed: {msg}");
                    last_error = msg;
                    if attempt < attempts {
                        self.sleeper.sleep(self.retry.backoff(attempt)).await;
                    }
                }
            }
        }

        self.current = None;
        Err(AuthError::Unavailable {
            attempts,
            last_error,
        })
    }

    async fn authenticate_once(&self) -> Result<Token, AttemptError> {
        let mut failures = Vec::new();

        for base in &self.endpoints {
            if let Some(refresh_token) = &self.refresh_token {
                let body = json!({ "refresh_token": refresh_token });
                match self.post(base, REFRESH_PATH, &body).await {
                    Ok(token) => return Ok(token),
                    Err(CallError::Status(status)) => {
                        debug!("{base} refused the refresh token ({status}), logging in instead");
                    }
                    Err(CallError::Failed(msg)) => {
                        debug!("refresh on {base} failed ({msg}), logging in instead");
                    }
                    Err(CallError::Unreachable(msg)) => {
                        failures.push(msg);
                        continue;
                    }
                }
            }

            let body = json!({
                "username": self.credentials.username,
                "password": self.credentials.password,
            });
            match self.post(base, LOGIN_PATH, &body).await {
                Ok(token) => return Ok(token),
                Err(CallError::Status(status))
                    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN =>
                {
                    return Err(AttemptError::Rejected {
                        status,
                        endpoint: base.clone(),
                    });
                }
                Err(CallError::Status(status)) => {
                    failures.push(format!("{base}{LOGIN_PATH}: HTTP {status}"));
                }
                Err(CallError::Failed(msg) | CallError::Unreachable(msg)) => failures.push(msg),
            }
        }

        Err(AttemptError::Failed(failures.join("; ")))
    }

    async fn post(
        &self,
        base: &str,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<Token, CallError> {
        let url = format!("{base}{path}");
        debug!("POST {url}");

        let obtained_at = self.clock.now();
        let response = self
            .http
            .post(&url)
            .header(ACCEPT, "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| CallError::Unreachable(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CallError::Status(status));
        }

        let text = response
            .text()
            .await
            .map_err(|e| CallError::Failed(format!("{url}: failed to read body: {e}")))?;
        let data = serde_json::from_str::<AuthResponse>(&text)
            .map_err(|e| CallError::Failed(format!("{url}: invalid auth response: {e}")))?
            .into_data();

        if data.access_token.trim().is_empty() {
            return Err(CallError::Failed(format!("{url}: empty access token")));
        }

        Ok(self.build_token(data, obtained_at))
    }

    /// TTL comes from `expires_in`, else the JWT `exp` claim, else the configured default
    fn build_token(&self, data: AuthData, obtained_at: DateTime<Utc>) -> Token {
        let from_server = data.expires_in.filter(|secs| *secs > 0).and_then(|secs| {
            let expires_at = TimeDelta::try_seconds(secs)
                .and_then(|ttl| obtained_at.checked_add_signed(ttl))
                .filter(|expires_at| *expires_at <= obtained_at + MAX_TTL);
            if expires_at.is_none() {
                warn!("ignoring implausible expires_in of {secs}s");
            }
            expires_at
        });

        let expires_at = match from_server {
            Some(expires_at) => expires_at,
            None => match jwt_expiry(&data.access_token) {
                Some(exp) if exp > obtained_at && exp <= obtained_at + MAX_TTL => exp,
                Some(exp) => {
                    warn!("token claims to expire at {exp}, using default ttl");
                    self.default_expiry(obtained_at)
                }
                None => self.default_expiry(obtained_at),
            },
        };

        Token {
            value: data.access_token,
            refresh_token: data
                .refresh_token
                .filter(|t| !t.is_empty())
                .or_else(|| self.refresh_token.clone()),
            obtained_at,
            expires_at,
        }
    }

    fn default_expiry(&self, obtained_at: DateTime<Utc>) -> DateTime<Utc> {
        obtained_at
            .checked_add_signed(self.default_ttl.min(MAX_TTL))
            .unwrap_or(obtained_at + MAX_TTL)
    }

    fn persist(&self, token: &Token) {
        // the token is still good for this run even if the disk is not
        if let Err(e) = self.store.save(token) {
            error!(
                "failed to persist access token to {}: {e}",
                self.store.path().display()
            );
        }
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(duration.as_millis().min(i64::MAX as u128) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcs::token::tests::make_jwt;
    use crate::time::{ManualClock, RecordingSleeper};
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use tempfile::{TempDir, tempdir};
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Fixture {
        _dir: TempDir,
        clock: Arc<ManualClock>,
        sleeper: Arc<RecordingSleeper>,
        manager: TokenManager,
    }

    fn fixture(endpoints: Vec<String>) -> Fixture {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let sleeper = Arc::new(RecordingSleeper::new());
        let manager = TokenManager::new(
            reqwest::Client::new(),
            endpoints,
            Credentials::new("collector", "hunter2"),
            TokenStore::new(dir.path().join("tokens").join("token_storage.json")),
        )
        .with_retry(RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            multiplier: 2.0,
        })
        .with_clock(clock.clone())
        .with_sleeper(sleeper.clone());

        Fixture {
            _dir: dir,
            clock,
            sleeper,
            manager,
        }
    }

    fn login_ok(token: &str, expires_in: Option<i64>) -> ResponseTemplate {
        let mut data = json!({ "access_token": token, "refresh_token": "refresh-1" });
        if let Some(secs) = expires_in {
            data["expires_in"] = json!(secs);
        }
        ResponseTemplate::new(200).set_body_json(json!({ "data": data }))
    }

    #[tokio::test]
    async fn test_refresh_uses_server_ttl_and_persists() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(LOGIN_PATH))
            .and(body_json(json!({ "username": "collector", "password": "hunter2" })))
            .respond_with(login_ok("token-1", Some(3600)))
            .expect(1)
            .mount(&server)
            .await;

        let mut f = fixture(vec![server.uri()]);
        let token = f.manager.refresh().await.unwrap();

        assert_eq!(token.value, "token-1");
        assert_eq!(token.ttl(), chrono::Duration::seconds(3600));
        assert_eq!(f.manager.store().load().unwrap(), Some(token));
    }

    #[tokio::test]
    async fn test_jwt_exp_used_when_server_omits_ttl() {
        let server = MockServer::start().await;
        let now = Utc::now();
        let exp = now.timestamp() + 1800;
        Mock::given(method("POST"))
            .and(path(LOGIN_PATH))
            .respond_with(login_ok(&make_jwt(exp), None))
            .mount(&server)
            .await;

        let mut f = fixture(vec![server.uri()]);
        f.clock.set(now);
        let token = f.manager.refresh().await.unwrap();

        assert_eq!(token.expires_at.timestamp(), exp);
    }

    #[tokio::test]
    async fn test_default_ttl_for_opaque_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(LOGIN_PATH))
            .respond_with(login_ok("opaque", None))
            .mount(&server)
            .await;

        let mut f = fixture(vec![server.uri()]);
        f.manager = f.manager.with_default_ttl(Duration::from_secs(900));
        let token = f.manager.refresh().await.unwrap();

        assert_eq!(token.ttl(), chrono::Duration::seconds(900));
    }

    #[tokio::test]
    async fn test_valid_token_is_reused() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(LOGIN_PATH))
            .respond_with(login_ok("token-1", Some(3600)))
            .expect(1)
            .mount(&server)
            .await;

        let mut f = fixture(vec![server.uri()]);
        let first = f.manager.get_valid_token().await.unwrap();
        f.clock.advance(chrono::Duration::seconds(600));
        let second = f.manager.get_valid_token().await.unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_token_inside_margin_is_renewed_with_refresh_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(LOGIN_PATH))
            .respond_with(login_ok("token-1", Some(3600)))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(REFRESH_PATH))
            .and(body_json(json!({ "refresh_token": "refresh-1" })))
            .respond_with(login_ok("token-2", Some(3600)))
            .expect(1)
            .mount(&server)
            .await;

        let mut f = fixture(vec![server.uri()]);
        f.manager.get_valid_token().await.unwrap();
        // 30s before expiry is inside the 60s safety margin
        f.clock.advance(chrono::Duration::seconds(3570));
        let renewed = f.manager.get_valid_token().await.unwrap();

        assert_eq!(renewed.value, "token-2");
    }

    #[tokio::test]
    async fn test_rejected_refresh_token_falls_back_to_login() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(REFRESH_PATH))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(LOGIN_PATH))
            .respond_with(login_ok("fresh-login", Some(3600)))
            .expect(1)
            .mount(&server)
            .await;

        let mut f = fixture(vec![server.uri()]);
        f.manager.refresh_token = Some("stale".to_string());
        let token = f.manager.refresh().await.unwrap();

        assert_eq!(token.value, "fresh-login");
    }

    #[tokio::test]
    async fn test_bad_credentials_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(LOGIN_PATH))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let mut f = fixture(vec![server.uri()]);
        let result = f.manager.get_valid_token().await;

        assert_matches!(result, Err(AuthError::Credentials { status: 401, .. }));
        assert!(f.sleeper.delays().is_empty());
        assert_matches!(f.manager.store().load(), Ok(None));
    }

    #[tokio::test]
    async fn test_forbidden_login_is_a_credentials_error_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(LOGIN_PATH))
            .respond_with(ResponseTemplate::new(403))
            .expect(1)
            .mount(&server)
            .await;

        let mut f = fixture(vec![server.uri()]);
        let result = f.manager.refresh().await;

        assert_matches!(result, Err(AuthError::Credentials { status: 403, .. }));
        assert!(f.sleeper.delays().is_empty());
        assert!(f.manager.current().is_none());
    }

    #[tokio::test]
    async fn test_unavailable_after_retry_budget_and_nothing_persisted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(LOGIN_PATH))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let mut f = fixture(vec![server.uri()]);
        let result = f.manager.get_valid_token().await;

        assert_matches!(result, Err(AuthError::Unavailable { attempts: 3, .. }));
        assert_eq!(
            f.sleeper.delays(),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
        assert!(f.manager.current().is_none());
        assert_matches!(f.manager.store().load(), Ok(None));
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_file_intact() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(LOGIN_PATH))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let mut f = fixture(vec![server.uri()]);
        let old = Token {
            value: "old".to_string(),
            refresh_token: None,
            obtained_at: f.clock.now() - chrono::Duration::hours(2),
            expires_at: f.clock.now() - chrono::Duration::hours(1),
        };
        f.manager.store().save(&old).unwrap();

        assert!(f.manager.refresh().await.is_err());
        assert_eq!(f.manager.store().load().unwrap(), Some(old));
    }

    #[tokio::test]
    async fn test_secondary_used_when_primary_unreachable() {
        let secondary = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(LOGIN_PATH))
            .respond_with(login_ok("from-secondary", Some(3600)))
            .mount(&secondary)
            .await;

        // nothing listens on port 9 (discard) on the test host
        let mut f = fixture(vec!["http://127.0.0.1:9".to_string(), secondary.uri()]);
        let token = f.manager.refresh().await.unwrap();

        assert_eq!(token.value, "from-secondary");
        assert!(f.sleeper.delays().is_empty());
    }

    #[tokio::test]
    async fn test_huge_expires_in_falls_back_to_default_ttl() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(LOGIN_PATH))
            .respond_with(login_ok("token-1", Some(10_000_000_000_000)))
            .mount(&server)
            .await;

        let mut f = fixture(vec![server.uri()]);
        let token = f.manager.refresh().await.unwrap();

        assert_eq!(token.ttl(), chrono::Duration::hours(1));
        assert_eq!(f.manager.store().load().unwrap(), Some(token));
    }

    #[tokio::test]
    async fn test_garbled_refresh_response_falls_through_to_login() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(REFRESH_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(LOGIN_PATH))
            .respond_with(login_ok("after-login", Some(3600)))
            .expect(1)
            .mount(&server)
            .await;

        let mut f = fixture(vec![server.uri()]);
        f.manager.refresh_token = Some("refresh-0".to_string());
        let token = f.manager.refresh().await.unwrap();

        assert_eq!(token.value, "after-login");
        assert!(f.sleeper.delays().is_empty());
    }

    #[tokio::test]
    async fn test_garbage_response_counts_as_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(LOGIN_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
            .mount(&server)
            .await;

        let mut f = fixture(vec![server.uri()]);
        let result = f.manager.refresh().await;

        assert_matches!(result, Err(AuthError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn test_load_persisted_rejects_expired_token() {
        let mut f = fixture(vec![]);
        let now = f.clock.now();
        f.manager
            .store()
            .save(&Token {
                value: "expired".to_string(),
                refresh_token: None,
                obtained_at: now - chrono::Duration::hours(2),
                expires_at: now - chrono::Duration::seconds(1),
            })
            .unwrap();

        assert!(f.manager.load_persisted().is_none());
        assert!(!f.manager.restore());
        assert!(f.manager.current().is_none());
    }

    #[tokio::test]
    async fn test_restore_adopts_valid_token_without_network() {
        let mut f = fixture(vec!["http://127.0.0.1:9".to_string()]);
        let now = f.clock.now();
        let saved = Token {
            value: "persisted".to_string(),
            refresh_token: Some("r".to_string()),
            obtained_at: now - chrono::Duration::minutes(5),
            expires_at: now + chrono::Duration::minutes(55),
        };
        f.manager.store().save(&saved).unwrap();

        assert!(f.manager.restore());
        assert_eq!(f.manager.get_valid_token().await.unwrap(), saved);
    }
}
