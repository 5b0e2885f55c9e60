use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use tracing::trace;

/// Connection details for the MCS appliance pair
#[derive(Clone)]
pub struct McsConfig {
    pub primary: String,
    pub secondary: String,
    pub port: u16,
    /// `https` in production, tests point this at plain-http mock servers
    pub scheme: String,
    pub username: String,
    pub password: String,
    /// Accept self-signed appliance certificates
    pub insecure_tls: bool,
}

impl McsConfig {
    pub fn primary_url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.primary, self.port)
    }

    pub fn secondary_url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.secondary, self.port)
    }
}

impl fmt::Debug for McsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("McsConfig")
            .field("primary", &self.primary)
            .field("secondary", &self.secondary)
            .field("port", &self.port)
            .field("scheme", &self.scheme)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("insecure_tls", &self.insecure_tls)
            .finish()
    }
}

/// Basic-auth credentials for reading encoders directly
#[derive(Clone)]
pub struct EncoderConfig {
    pub username: String,
    pub password: String,
    /// Encoders serve their API over plain `http` unless configured otherwise
    pub scheme: String,
}

impl fmt::Debug for EncoderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncoderConfig")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("scheme", &self.scheme)
            .finish()
    }
}

/// Storage backend configuration
#[derive(Debug, Clone)]
pub enum StorageConfig {
    /// In-memory storage (no persistence)
    None,

    /// SQLite database file
    Sqlite { path: PathBuf },

    /// PostgreSQL server
    Postgres(PostgresConfig),
}

#[derive(Clone)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    /// Required, there is deliberately no default
    pub password: Option<String>,
}

impl fmt::Debug for PostgresConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Retry schedule as it appears in the tuning file
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl RetryConfig {
    fn single() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    1_000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

/// Operational knobs, read from the optional JSON tuning file
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct Tuning {
    #[serde(default)]
    pub token: TokenTuning,

    #[serde(default)]
    pub fetch: FetchTuning,

    #[serde(default)]
    pub storage: StorageTuning,

    #[serde(default)]
    pub inventory: InventoryTuning,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct TokenTuning {
    /// Used when MCS reports neither `expires_in` nor a JWT `exp` claim
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,

    /// A token stops counting as valid this long before it actually expires
    #[serde(default = "default_safety_margin_secs")]
    pub safety_margin_secs: u64,

    #[serde(default = "default_auth_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for TokenTuning {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_ttl_secs(),
            safety_margin_secs: default_safety_margin_secs(),
            request_timeout_secs: default_auth_timeout_secs(),
            retry: RetryConfig::default(),
        }
    }
}

fn default_ttl_secs() -> u64 {
    3600
}

fn default_safety_margin_secs() -> u64 {
    60
}

fn default_auth_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct FetchTuning {
    #[serde(default = "default_alarms_path")]
    pub alarms_path: String,

    /// Consecutive failures before switching to the other MCS host
    #[serde(default = "default_failover_threshold")]
    pub failover_threshold: u32,

    #[serde(default = "default_fetch_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "RetryConfig::single")]
    pub retry: RetryConfig,
}

impl Default for FetchTuning {
    fn default() -> Self {
        Self {
            alarms_path: default_alarms_path(),
            failover_threshold: default_failover_threshold(),
            request_timeout_secs: default_fetch_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            retry: RetryConfig::single(),
        }
    }
}

fn default_alarms_path() -> String {
    "/api/5.1/alarms".to_string()
}

fn default_failover_threshold() -> u32 {
    3
}

fn default_fetch_timeout_secs() -> u64 {
    15
}

fn default_connect_timeout_secs() -> u64 {
    5
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct StorageTuning {
    /// Upper bound for any single database call
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,

    #[serde(default = "RetryConfig::single")]
    pub connect_retry: RetryConfig,
}

impl Default for StorageTuning {
    fn default() -> Self {
        Self {
            operation_timeout_secs: default_operation_timeout_secs(),
            connect_retry: RetryConfig::single(),
        }
    }
}

fn default_operation_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct InventoryTuning {
    /// Refresh the device inventory every N iterations, 0 turns it off
    #[serde(default = "default_inventory_every")]
    pub every_iterations: u64,

    /// Per-request bound when reading an encoder directly
    #[serde(default = "default_encoder_timeout_secs")]
    pub encoder_timeout_secs: u64,
}

impl Default for InventoryTuning {
    fn default() -> Self {
        Self {
            every_iterations: default_inventory_every(),
            encoder_timeout_secs: default_encoder_timeout_secs(),
        }
    }
}

fn default_encoder_timeout_secs() -> u64 {
    10
}

fn default_inventory_every() -> u64 {
    10
}

/// Fully assembled collector configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mcs: McsConfig,
    pub storage: StorageConfig,
    /// Encoder output polling, off when no encoder credentials are configured
    pub encoders: Option<EncoderConfig>,
    pub token_path: PathBuf,
    pub poll_interval: Duration,
    pub tuning: Tuning,
}

/// Reasons a configuration is refused at startup
#[derive(Debug)]
pub enum ConfigError {
    /// A required value was not provided
    Missing(&'static str),

    /// A value was provided but cannot be used
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Missing(name) => write!(f, "missing required configuration: {name}"),
            ConfigError::Invalid(msg) => write!(f, "invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

fn require(value: &str, name: &'static str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Missing(name));
    }
    Ok(())
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        require(&self.mcs.primary, "MCS_IP_PRIMARY")?;
        require(&self.mcs.secondary, "MCS_IP_SECONDARY")?;
        require(&self.mcs.username, "MCS_USERNAME")?;
        require(&self.mcs.password, "MCS_PASSWORD")?;

        if self.mcs.scheme != "https" && self.mcs.scheme != "http" {
            return Err(ConfigError::Invalid(format!(
                "unsupported MCS scheme '{}'",
                self.mcs.scheme
            )));
        }

        if let StorageConfig::Postgres(pg) = &self.storage {
            require(&pg.host, "SQL_SERVER")?;
            require(&pg.database, "SQL_DATABASE")?;
            require(&pg.username, "SQL_USERNAME")?;
            match &pg.password {
                Some(password) => require(password, "SQL_PASSWORD")?,
                None => return Err(ConfigError::Missing("SQL_PASSWORD")),
            }
        }

        if let Some(encoders) = &self.encoders {
            require(&encoders.username, "ENCODER_USERNAME")?;
            require(&encoders.password, "ENCODER_PASSWORD")?;
        }

        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "poll interval must be at least one second".to_string(),
            ));
        }

        if self.tuning.fetch.failover_threshold == 0 {
            return Err(ConfigError::Invalid(
                "failover threshold must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

pub fn read_tuning_file(path: &str) -> anyhow::Result<Tuning> {
    let file_content = std::fs::read_to_string(path)?;
    serde_json::from_str(&file_content)
        .map_err(|e| anyhow::anyhow!("Invalid tuning file provided: {e}"))
        .inspect(|tuning| trace!("loaded tuning: {tuning:?}"))
}
