//! Error types for talking to MCS

use std::fmt;

/// Failure to obtain a usable access token
#[derive(Debug, Clone, PartialEq)]
pub enum AuthError {
    /// MCS refused the configured username/password (HTTP 401/403).
    ///
    /// Not retried within the cycle; the next cycle tries again so an operator can fix the
    /// credentials without restarting the process.
    Credentials { status: u16, endpoint: String },

    /// Neither MCS host produced a token within the retry budget
    Unavailable { attempts: u32, last_error: String },
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::Credentials { status, endpoint } => {
                write!(f, "MCS at {endpoint} rejected the credentials (HTTP {status})")
            }
            AuthError::Unavailable {
                attempts,
                last_error,
            } => write!(
                f,
                "could not authenticate against MCS after {attempts} attempt(s): {last_error}"
            ),
        }
    }
}

impl std::error::Error for AuthError {}

/// Failure of a single authenticated read
#[derive(Debug, Clone, PartialEq)]
pub enum FetchError {
    /// MCS answered 401: the token must be refreshed before the next attempt
    AuthExpired { endpoint: String },

    /// Timeout, refused connection, 5xx or any other unexpected status
    Transient(String),

    /// The response body could not be understood
    Malformed(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::AuthExpired { endpoint } => {
                write!(f, "MCS at {endpoint} rejected the access token (HTTP 401)")
            }
            FetchError::Transient(msg) => write!(f, "transient fetch failure: {msg}"),
            FetchError::Malformed(msg) => write!(f, "malformed MCS response: {msg}"),
        }
    }
}

impl std::error::Error for FetchError {}
