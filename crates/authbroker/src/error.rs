//! Error taxonomy
//!
//! Errors that reach a caller are carried as a wire name plus a
//! human-readable message. Internal faults never escape a request: they are
//! converted to one of the [`ErrorKind`]s before the reply is sent.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::request::RequestId;

/// Prefix shared by every wire error name
pub const ERROR_PREFIX: &str = "org.authbroker.Error";

/// Error kinds a caller can receive in a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The user (or the caller) canceled the request
    UserCanceled,
    /// The request parameters were malformed or contradictory
    InvalidParameters,
    /// Trust or consent was denied
    Forbidden,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserCanceled => "UserCanceled",
            Self::InvalidParameters => "InvalidParameters",
            Self::Forbidden => "Forbidden",
        }
    }

    /// Fully qualified name used on the wire
    pub fn wire_name(&self) -> String {
        format!("{}.{}", ERROR_PREFIX, self.as_str())
    }

    /// Parse either the short or the fully qualified name
    pub fn from_name(name: &str) -> Option<Self> {
        let short = name
            .strip_prefix(ERROR_PREFIX)
            .and_then(|rest| rest.strip_prefix('.'))
            .unwrap_or(name);
        match short {
            "UserCanceled" => Some(Self::UserCanceled),
            "InvalidParameters" => Some(Self::InvalidParameters),
            "Forbidden" => Some(Self::Forbidden),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors raised by the broker core
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("Invalid request: {0}")]
    InvalidParameters(String),

    #[error("Access denied: {0}")]
    Forbidden(String),

    #[error("Consent for {0} has not been granted")]
    ConsentRequired(RequestId),

    #[error("No such request: {0}")]
    UnknownRequest(RequestId),

    #[error("Service is shutting down")]
    ShuttingDown,
}

impl BrokerError {
    /// The reply kind a caller observes for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidParameters(_) | Self::UnknownRequest(_) => ErrorKind::InvalidParameters,
            Self::Forbidden(_) | Self::ConsentRequired(_) | Self::ShuttingDown => {
                ErrorKind::Forbidden
            }
        }
    }
}
