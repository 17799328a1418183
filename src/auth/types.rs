// Authentication types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which half of the credential pair an operation refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Access,
    Refresh,
}

/// Access/refresh token pair
///
/// Both tokens are expected to be present together. A pair missing either
/// half is treated as no session at all.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPair {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

impl CredentialPair {
    /// Build a complete pair
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: Some(access_token.into()),
            refresh_token: Some(refresh_token.into()),
        }
    }

    /// Pair with neither token
    pub fn empty() -> Self {
        Self::default()
    }

    /// Both tokens present and non-empty
    pub fn is_complete(&self) -> bool {
        matches!(
            (&self.access_token, &self.refresh_token),
            (Some(a), Some(r)) if !a.is_empty() && !r.is_empty()
        )
    }

    /// Token of the given kind, only when the pair is complete
    pub fn token(&self, kind: TokenKind) -> Option<&str> {
        if !self.is_complete() {
            return None;
        }
        match kind {
            TokenKind::Access => self.access_token.as_deref(),
            TokenKind::Refresh => self.refresh_token.as_deref(),
        }
    }
}

/// Snapshot of the session for status displays
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenInfo {
    pub has_access_token: bool,
    pub has_refresh_token: bool,
    pub is_authenticated: bool,
    pub access_expires_at: Option<DateTime<Utc>>,
    pub refresh_expires_at: Option<DateTime<Utc>>,
}

/// How the backend judges an access token (`GET {base}/auth/token-status`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenStatus {
    pub valid: bool,
    #[serde(default)]
    pub needs_refresh: bool,
    /// Why the token is not valid: `expired`, `no_expiration`, `invalid_token`
    pub reason: Option<String>,
    /// Seconds left before expiry
    pub time_until_expiry: Option<f64>,
    pub expires_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
    pub username: Option<String>,
    pub role: Option<String>,
}

/// Login request body
#[derive(Serialize)]
pub struct LoginRequest<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

/// Refresh request body
#[derive(Serialize)]
pub struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

/// Backend response envelope: `{status, data, message?}`
#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    pub status: u16,
    pub data: Option<T>,
    pub message: Option<String>,
}

/// Token pair as issued by the backend
#[derive(Debug, Deserialize)]
pub struct TokenData {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}
