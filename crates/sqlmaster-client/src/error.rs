//! Error taxonomy for the client core
//!
//! Three classes reach callers: locally detected [`ValidationError`]s that never
//! touch the network, [`ClientError::AuthenticationExpired`] for 401 responses on
//! authenticated calls, and [`ClientError::Remote`] for everything else the
//! remote service or the transport reports.

use thiserror::Error;

/// Minimum accepted password length for sign-up.
pub const MIN_SECRET_LEN: usize = 6;

/// Input rejected before any request is built.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("SQL query is empty")]
    EmptyQuery,

    #[error("no file selected")]
    NoFileSelected,

    #[error("selected file is empty")]
    EmptyFile,

    #[error("unsupported file type '{0}' (expected .csv, .xlsx or .xls)")]
    UnsupportedFileType(String),

    #[error("source name is empty")]
    EmptySourceName,

    #[error("username is required")]
    MissingIdentity,

    #[error("password is required")]
    MissingSecret,

    #[error("email is required")]
    MissingEmail,

    #[error("passwords do not match")]
    SecretMismatch,

    #[error("password must be at least {} characters", MIN_SECRET_LEN)]
    SecretTooShort,

    #[error("not signed in")]
    NotSignedIn,

    #[error("an upload is already in progress")]
    UploadInProgress,
}

/// Failure of a client operation.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("session expired, please sign in again")]
    AuthenticationExpired,

    #[error("{detail}")]
    Remote { status: Option<u16>, detail: String },

    #[error("session storage error: {0}")]
    Storage(#[source] anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ClientError {
    pub fn remote(status: Option<u16>, detail: impl Into<String>) -> Self {
        Self::Remote {
            status,
            detail: detail.into(),
        }
    }

    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Self::AuthenticationExpired)
    }

    /// Text suitable for a chat entry or an inline error message.
    pub fn user_detail(&self) -> String {
        match self {
            Self::Remote { detail, .. } => detail.clone(),
            other => other.to_string(),
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        let detail = if e.is_timeout() {
            "request timed out before the service responded".to_string()
        } else if e.is_connect() {
            "network error: the service is unreachable".to_string()
        } else if e.is_decode() {
            format!("unexpected response from the service: {}", e)
        } else {
            format!("network error: {}", e)
        };
        Self::Remote {
            status: e.status().map(|s| s.as_u16()),
            detail,
        }
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;
