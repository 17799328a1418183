// Error handling module
// Defines the session error taxonomy and collaborator failures

use thiserror::Error;

/// Failure reported by an injected collaborator (transport or store)
///
/// Cloneable so a single refresh outcome can be handed to every waiter.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// Connection, timeout or other I/O failure before a response arrived
    #[error("Network error: {0}")]
    Network(String),

    /// HTTP-level non-success status
    #[error("HTTP error: {status} - {message}")]
    Status { status: u16, message: String },

    /// Backend envelope reported failure (`status != 200`)
    #[error("Backend rejected request: {status} - {message}")]
    Envelope { status: u16, message: String },

    /// Response could not be understood
    #[error("Malformed response: {0}")]
    Malformed(String),

    /// Persistence collaborator failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// The collaborator does not offer this call
    #[error("Not supported: {0}")]
    Unsupported(String),
}

impl TransportError {
    /// HTTP status carried by the error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            return TransportError::Malformed(e.to_string());
        }
        if let Some(status) = e.status() {
            return TransportError::Status {
                status: status.as_u16(),
                message: e.to_string(),
            };
        }

        let kind = if e.is_timeout() {
            "timeout"
        } else if e.is_connect() {
            "connection_failed"
        } else if e.is_request() {
            "request_error"
        } else if e.is_body() {
            "body_error"
        } else {
            "unknown"
        };
        TransportError::Network(format!("{} (kind: {})", e, kind))
    }
}

impl From<rusqlite::Error> for TransportError {
    fn from(e: rusqlite::Error) -> Self {
        TransportError::Storage(e.to_string())
    }
}

/// Errors surfaced by the credential refresh coordinator
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuthError {
    /// No usable tokens, or the refresh token has expired; re-authenticate
    #[error("Session expired, please login again")]
    SessionExpired,

    /// The refresh call failed; credentials have been cleared
    #[error("Token refresh failed: {0}")]
    RefreshFailed(#[source] TransportError),

    /// A wrapped request failed for a reason other than authorization
    #[error("Request failed: {0}")]
    RequestFailed(#[source] TransportError),

    /// The request was still rejected with 401 after a refresh and retry
    #[error("Authentication failed after token refresh")]
    Unauthorized,

    /// Login was rejected by the backend or could not be completed
    #[error("Login failed: {0}")]
    LoginFailed(#[source] TransportError),
}

impl AuthError {
    /// Whether the host should send the user back through login
    pub fn requires_login(&self) -> bool {
        matches!(
            self,
            AuthError::SessionExpired | AuthError::RefreshFailed(_) | AuthError::Unauthorized
        )
    }
}

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, AuthError>;
