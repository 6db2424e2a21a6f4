//! Relay Errors
//!
//! Named failure kinds for backend calls. An empty backend answer is not an
//! error; it is reported as [`Completion::NoResponse`](crate::backend::Completion)
//! so orchestrators can tell "fall back" apart from "propagate".

use thiserror::Error;

/// Errors raised while relaying a request to the backend
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    /// The backend could not be reached (connection refused, host unreachable)
    #[error("Backend unreachable at {address}: {reason}")]
    BackendUnreachable {
        /// Configured backend address
        address: String,
        /// Underlying transport message
        reason: String,
    },

    /// The backend answered with a non-success status
    #[error("Backend returned HTTP {status}: {body}")]
    BackendHttp {
        /// HTTP status code
        status: u16,
        /// Response body, as text
        body: String,
    },

    /// The backend reported an error inside an otherwise healthy stream
    #[error("Backend reported an error: {0}")]
    BackendReported(String),

    /// The backend did not answer in time
    #[error("Backend request to {address} timed out")]
    Timeout {
        /// Configured backend address
        address: String,
    },

    /// The consumer went away before the answer was complete
    #[error("Request aborted by the client")]
    Aborted,

    /// Any other transport failure (body read, stream interruption)
    #[error("Transport failure: {0}")]
    Transport(String),

    /// A single-shot response body was not valid JSON
    #[error("Failed to decode backend response: {0}")]
    Decode(String),
}

impl RelayError {
    /// Classify a `reqwest` failure against the configured backend address
    pub(crate) fn from_reqwest(err: &reqwest::Error, address: &str) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                address: address.to_string(),
            }
        } else if err.is_connect() {
            Self::BackendUnreachable {
                address: address.to_string(),
                reason: err.to_string(),
            }
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }

    /// Whether this failure should be reported as a timeout/abort (HTTP 504)
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Aborted)
    }
}

/// Result alias for relay operations
pub type RelayResult<T> = Result<T, RelayError>;
