//! Client side of the MCS HTTP API
//!
//! - [`auth::TokenManager`] owns the bearer token and its on-disk copy
//! - [`fetcher::AlarmFetcher`] issues the authenticated reads, with primary/secondary failover
//! - [`encoder::EncoderClient`] reads output lists straight from the encoders
//! - [`wire`] turns MCS response bodies into domain types

pub mod auth;
pub mod encoder;
pub mod endpoint;
pub mod error;
pub mod fetcher;
pub mod token;
pub mod wire;

use std::time::Duration;

pub use auth::{Credentials, TokenManager};
pub use encoder::{ENCODER_OUTPUTS_PATH, EncoderClient};
pub use endpoint::{EndpointChoice, EndpointState};
pub use error::{AuthError, FetchError};
pub use fetcher::AlarmFetcher;
pub use token::{Token, TokenStore};

pub const LOGIN_PATH: &str = "/api/5.1/auth/login";
pub const REFRESH_PATH: &str = "/api/5.1/auth/token/refresh";
pub const DEVICES_PATH: &str = "/api/5.1/devices/config";
pub const DEVICE_STATUS_PATH: &str = "/api/5.1/devices/status";
pub const OUTPUTS_PATH: &str = "/api/5.1/outputs/config";

/// Build the HTTP client used to talk to MCS
///
/// Every request is bounded by `timeout` so a dead appliance can never stall the loop.
pub fn build_http_client(
    timeout: Duration,
    connect_timeout: Duration,
    accept_invalid_certs: bool,
) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(connect_timeout)
        .danger_accept_invalid_certs(accept_invalid_certs)
        .build()
}
