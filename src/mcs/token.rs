//! Access token and its single-slot file
//!
//! The file is JSON and carries a format version plus both timestamps, so a truncated,
//! foreign or tampered file is detected instead of being handed out as a credential.

use std::fmt;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::util::atomic_write;

const TOKEN_FILE_VERSION: u32 = 1;

/// Bearer token issued by MCS
#[derive(Clone, PartialEq)]
pub struct Token {
    pub value: String,
    /// Lets the next renewal use the cheaper refresh call instead of a full login
    pub refresh_token: Option<String>,
    pub obtained_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Token {
    /// A token is only handed out while `now < expires_at - margin`
    pub fn is_valid_at(&self, now: DateTime<Utc>, margin: chrono::Duration) -> bool {
        now < self.expires_at - margin
    }

    pub fn ttl(&self) -> chrono::Duration {
        self.expires_at - self.obtained_at
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("value", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("obtained_at", &self.obtained_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Serialize, Deserialize)]
struct TokenFile {
    version: u32,
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    obtained_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

#[derive(Debug)]
pub enum TokenFileError {
    Io(std::io::Error),
    Corrupt(String),
}

impl fmt::Display for TokenFileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenFileError::Io(err) => write!(f, "token file I/O error: {err}"),
            TokenFileError::Corrupt(msg) => write!(f, "token file is corrupt: {msg}"),
        }
    }
}

impl std::error::Error for TokenFileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TokenFileError::Io(err) => Some(err),
            TokenFileError::Corrupt(_) => None,
        }
    }
}

/// Durable single-slot home of the current token
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, token: &Token) -> std::io::Result<()> {
        let file = TokenFile {
            version: TOKEN_FILE_VERSION,
            access_token: token.value.clone(),
            refresh_token: token.refresh_token.clone(),
            obtained_at: token.obtained_at,
            expires_at: token.expires_at,
        };
        let data = serde_json::to_vec_pretty(&file).map_err(std::io::Error::other)?;
        atomic_write(&self.path, &data)
    }

    /// Read the stored token without judging its expiry
    ///
    /// `Ok(None)` means there is no file yet.
    pub fn load(&self) -> Result<Option<Token>, TokenFileError> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(TokenFileError::Io(err)),
        };

        let file: TokenFile = serde_json::from_slice(&data)
            .map_err(|e| TokenFileError::Corrupt(e.to_string()))?;

        if file.version != TOKEN_FILE_VERSION {
            return Err(TokenFileError::Corrupt(format!(
                "unsupported version {}",
                file.version
            )));
        }
        if file.access_token.trim().is_empty() {
            return Err(TokenFileError::Corrupt("empty access token".to_string()));
        }
        if file.expires_at <= file.obtained_at {
            return Err(TokenFileError::Corrupt(
                "expiry is not after the time the token was obtained".to_string(),
            ));
        }

        Ok(Some(Token {
            value: file.access_token,
            refresh_token: file.refresh_token.filter(|t| !t.is_empty()),
            obtained_at: file.obtained_at,
            expires_at: file.expires_at,
        }))
    }
}

/// Expiry encoded in the `exp` claim, if the token is a JWT
///
/// The signature is not checked; this only tells us when MCS will stop accepting it.
pub fn jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    let mut parts = token.split('.');
    let (_header, payload, _signature) = (parts.next()?, parts.next()?, parts.next()?);

    let payload = payload.trim_end_matches('=');
    let decoded = URL_SAFE_NO_PAD
        .decode(payload)
        .or_else(|_| STANDARD_NO_PAD.decode(payload))
        .ok()?;

    let claims: serde_json::Value = serde_json::from_slice(&decoded).ok()?;
    let exp = claims.get("exp")?;
    let secs = exp.as_i64().or_else(|| exp.as_f64().map(|f| f as i64))?;

    DateTime::from_timestamp(secs, 0)
}
