//! Direct reads from the encoders MCS manages
//!
//! Encoders speak their own API with HTTP basic auth, separate from the MCS bearer token.

use reqwest::header::ACCEPT;
use tracing::{debug, instrument, trace};

use super::auth::Credentials;
use super::error::FetchError;
use super::wire;
use crate::EncoderOutput;

pub const ENCODER_OUTPUTS_PATH: &str = "/api/2.0/outputs/config/.json";

pub struct EncoderClient {
    http: reqwest::Client,
    credentials: Credentials,
    scheme: String,
}

impl EncoderClient {
    pub fn new(http: reqwest::Client, credentials: Credentials, scheme: impl Into<String>) -> Self {
        Self {
            http,
            credentials,
            scheme: scheme.into(),
        }
    }

    /// Output list of the encoder at `device_ip` (host or host:port)
    #[instrument(skip(self))]
    pub async fn fetch_outputs(&self, device_ip: &str) -> Result<Vec<EncoderOutput>, FetchError> {
        let url = format!("{}://{}{}", self.scheme, device_ip, ENCODER_OUTPUTS_PATH);
        trace!("GET {url}");

        let response = self
            .http
            .get(&url)
            .basic_auth(&self.credentials.username, Some(&self.credentials.password))
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| FetchError::Transient(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Transient(format!("{url}: HTTP {status}")));
        }

        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Transient(format!("{url}: failed to read body: {e}")))?;

        let outputs = wire::parse_encoder_outputs(device_ip, Some(&body))?;
        debug!("{} output(s) on encoder {}", outputs.len(), device_ip);
        Ok(outputs)
    }
}
