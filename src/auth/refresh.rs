// Token endpoint transport
// Login, refresh and logout calls against the backend auth API

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, Response};
use std::time::Duration;

use crate::error::TransportError;

use super::types::{CredentialPair, Envelope, LoginRequest, RefreshRequest, TokenData, TokenStatus};

/// Backend calls that issue or revoke credential pairs
#[async_trait]
pub trait RefreshTransport: Send + Sync {
    /// Exchange a refresh token for a new pair
    async fn refresh(&self, refresh_token: &str) -> Result<CredentialPair, TransportError>;

    /// Obtain a pair from username and password
    async fn login(&self, username: &str, password: &str)
        -> Result<CredentialPair, TransportError>;

    /// Revoke the session server-side
    async fn logout(&self, access_token: &str) -> Result<(), TransportError>;

    /// Backend's view of an access token
    async fn token_status(&self, _access_token: &str) -> Result<TokenStatus, TransportError> {
        Err(TransportError::Unsupported("token status check".to_string()))
    }
}

/// reqwest implementation of the backend auth endpoints
///
/// - `POST {base}/auth/token`   `{username, password}`
/// - `POST {base}/auth/refresh` `{refresh_token}`
/// - `POST {base}/auth/logout`  bearer header
/// - `GET  {base}/auth/token-status` bearer header
pub struct HttpAuthTransport {
    client: Client,
    base_url: String,
}

impl HttpAuthTransport {
    pub fn new(base_url: &str, connect_timeout: u64, request_timeout: u64) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout))
            .timeout(Duration::from_secs(request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self::with_client(client, base_url))
    }

    /// Reuse an existing client (shares its connection pool)
    pub fn with_client(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/auth/{}", self.base_url, path)
    }
}

#[async_trait]
impl RefreshTransport for HttpAuthTransport {
    async fn refresh(&self, refresh_token: &str) -> Result<CredentialPair, TransportError> {
        let url = self.endpoint("refresh");
        tracing::debug!(url = %url, "Sending token refresh request");

        let response = self
            .client
            .post(&url)
            .json(&RefreshRequest { refresh_token })
            .send()
            .await?;

        parse_token_response(response, "Refresh failed").await
    }

    async fn login(
        &self,
        username: &str,
        password: &str,
    ) -> Result<CredentialPair, TransportError> {
        let url = self.endpoint("token");
        tracing::debug!(url = %url, username = %username, "Sending login request");

        let response = self
            .client
            .post(&url)
            .json(&LoginRequest { username, password })
            .send()
            .await?;

        parse_token_response(response, "Login failed").await
    }

    async fn logout(&self, access_token: &str) -> Result<(), TransportError> {
        let url = self.endpoint("logout");
        tracing::debug!(url = %url, "Sending logout request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(access_token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                message: extract_message(&error_text),
            });
        }
        Ok(())
    }

    async fn token_status(&self, access_token: &str) -> Result<TokenStatus, TransportError> {
        let url = self.endpoint("token-status");
        tracing::debug!(url = %url, "Checking token status");

        let response = self
            .client
            .get(&url)
            .bearer_auth(access_token)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                message: extract_message(&body),
            });
        }

        let envelope: Envelope<TokenStatus> = serde_json::from_str(&body).map_err(|e| {
            TransportError::Malformed(format!("Failed to parse token status: {}", e))
        })?;
        if envelope.status != 200 {
            return Err(TransportError::Envelope {
                status: envelope.status,
                message: envelope
                    .message
                    .unwrap_or_else(|| "Token status check failed".to_string()),
            });
        }
        envelope
            .data
            .ok_or_else(|| TransportError::Malformed("Token status response has no data".to_string()))
    }
}

/// Turn a token endpoint response into a complete pair
async fn parse_token_response(
    response: Response,
    default_message: &str,
) -> Result<CredentialPair, TransportError> {
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        tracing::error!(
            status = status.as_u16(),
            response_body = %body,
            "Token endpoint returned error status"
        );
        return Err(TransportError::Status {
            status: status.as_u16(),
            message: extract_message(&body),
        });
    }

    let envelope: Envelope<TokenData> = serde_json::from_str(&body)
        .map_err(|e| TransportError::Malformed(format!("Failed to parse token response: {}", e)))?;

    if envelope.status != 200 {
        return Err(TransportError::Envelope {
            status: envelope.status,
            message: envelope
                .message
                .unwrap_or_else(|| default_message.to_string()),
        });
    }

    let data = envelope
        .data
        .ok_or_else(|| TransportError::Malformed("Token response has no data".to_string()))?;

    match (data.access_token, data.refresh_token) {
        (Some(access), Some(refresh)) if !access.is_empty() && !refresh.is_empty() => {
            Ok(CredentialPair::new(access, refresh))
        }
        _ => Err(TransportError::Malformed(
            "Token response does not contain both access_token and refresh_token".to_string(),
        )),
    }
}

/// Pull `message` out of a JSON error body, falling back to the raw text
fn extract_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("message")
                .or_else(|| v.get("detail"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.to_string())
}
