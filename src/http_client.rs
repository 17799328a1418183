use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

use crate::auth::CredentialPair;
use crate::error::TransportError;

/// Carries the refresh token so the backend can rotate the pair in-band
pub const REFRESH_TOKEN_HEADER: &str = "x-refresh-token";
/// Set to `true` by a backend that rotated the tokens while serving a request
pub const TOKEN_REFRESHED_HEADER: &str = "x-token-refreshed";
pub const NEW_ACCESS_TOKEN_HEADER: &str = "x-new-access-token";
pub const NEW_REFRESH_TOKEN_HEADER: &str = "x-new-refresh-token";

/// Description of an outgoing request, reusable across attempts
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    /// Absolute URL, or a path joined onto the transport's base URL
    pub path: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl RequestSpec {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serialize `value` as the JSON body
    pub fn with_json<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_vec(value)?;
        self.headers.insert(
            reqwest::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        self.body = Some(Bytes::from(body));
        Ok(self)
    }
}

/// Fully buffered response
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status == StatusCode::UNAUTHORIZED
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, TransportError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| TransportError::Malformed(format!("Failed to parse response body: {}", e)))
    }

    /// Credential pair the backend rotated in-band, if it did
    pub fn rotated_credentials(&self) -> Option<CredentialPair> {
        let refreshed = self
            .headers
            .get(TOKEN_REFRESHED_HEADER)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));
        if !refreshed {
            return None;
        }

        let header = |name: &str| {
            self.headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        let pair = CredentialPair {
            access_token: header(NEW_ACCESS_TOKEN_HEADER),
            refresh_token: header(NEW_REFRESH_TOKEN_HEADER),
        };
        pair.is_complete().then_some(pair)
    }
}

/// Issues an authenticated request
///
/// `refresh_token` is the session's current refresh token. Transports may
/// forward it so the backend can rotate the pair while serving the request.
#[async_trait]
pub trait RequestTransport: Send + Sync {
    async fn send(
        &self,
        spec: &RequestSpec,
        access_token: &str,
        refresh_token: Option<&str>,
    ) -> Result<TransportResponse, TransportError>;
}

/// reqwest-backed request transport with backoff on 429/5xx and network errors
///
/// 401 is never retried here; the coordinator owns that decision.
pub struct HttpRequestTransport {
    /// Shared HTTP client with connection pooling
    client: Client,

    /// Prefix for relative request paths
    base_url: String,

    /// Maximum number of retries
    max_retries: u32,

    /// Base delay for exponential backoff (milliseconds)
    base_delay_ms: u64,

    /// Send `X-Refresh-Token` alongside the bearer header
    forward_refresh_token: bool,
}

impl HttpRequestTransport {
    pub fn new(
        base_url: &str,
        connect_timeout: u64,
        request_timeout: u64,
        max_retries: u32,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout))
            .timeout(Duration::from_secs(request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_retries,
            base_delay_ms: 500,
            forward_refresh_token: true,
        })
    }

    /// Override the backoff base delay
    pub fn with_base_delay(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    /// Whether to send the refresh token with every request (on by default)
    pub fn with_refresh_token_header(mut self, enabled: bool) -> Self {
        self.forward_refresh_token = enabled;
        self
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}/{}", self.base_url, path.trim_start_matches('/'))
        }
    }

    /// Calculate exponential backoff delay
    fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        self.base_delay_ms.saturating_mul(2_u64.saturating_pow(attempt))
    }

    async fn execute_once(
        &self,
        url: &str,
        spec: &RequestSpec,
        access_token: &str,
        refresh_token: Option<&str>,
    ) -> Result<TransportResponse, reqwest::Error> {
        let mut builder = self
            .client
            .request(spec.method.clone(), url)
            .headers(spec.headers.clone())
            .bearer_auth(access_token);
        if let Some(refresh_token) = refresh_token.filter(|_| self.forward_refresh_token) {
            builder = builder.header(REFRESH_TOKEN_HEADER, refresh_token);
        }
        if let Some(body) = &spec.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;
        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}

#[async_trait]
impl RequestTransport for HttpRequestTransport {
    async fn send(
        &self,
        spec: &RequestSpec,
        access_token: &str,
        refresh_token: Option<&str>,
    ) -> Result<TransportResponse, TransportError> {
        let url = self.url_for(&spec.path);
        let mut attempt = 0;

        tracing::debug!(
            method = %spec.method,
            url = %url,
            "Sending HTTP request"
        );

        loop {
            match self.execute_once(&url, spec, access_token, refresh_token).await {
                Ok(response) => {
                    let status = response.status;
                    tracing::debug!(status = %status, "Received HTTP response");

                    let retryable = status == StatusCode::TOO_MANY_REQUESTS
                        || status.is_server_error();
                    if retryable && attempt < self.max_retries {
                        let delay = self.calculate_backoff_delay(attempt);
                        tracing::warn!(
                            "Received {}, retrying after {}ms (attempt {}/{})",
                            status,
                            delay,
                            attempt + 1,
                            self.max_retries
                        );
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        attempt += 1;
                        continue;
                    }

                    return Ok(response);
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        url = %url,
                        attempt = attempt + 1,
                        "HTTP request error"
                    );

                    if attempt < self.max_retries {
                        let delay = self.calculate_backoff_delay(attempt);
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        attempt += 1;
                        continue;
                    }

                    tracing::error!(
                        error = %e,
                        url = %url,
                        total_attempts = attempt + 1,
                        "HTTP request failed after all retries"
                    );
                    return Err(e.into());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_backoff_calculation() {
        let transport = HttpRequestTransport::new("http://localhost", 5, 5, 3).unwrap();

        assert_eq!(transport.calculate_backoff_delay(0), 500);
        assert_eq!(transport.calculate_backoff_delay(1), 1000);
        assert_eq!(transport.calculate_backoff_delay(2), 2000);
    }

    #[test]
    fn test_url_for() {
        let transport = HttpRequestTransport::new("http://localhost:8000/api/v1/", 5, 5, 0).unwrap();
        assert_eq!(transport.url_for("/cases"), "http://localhost:8000/api/v1/cases");
        assert_eq!(transport.url_for("auth/me"), "http://localhost:8000/api/v1/auth/me");
        assert_eq!(
            transport.url_for("https://other.example.com/x"),
            "https://other.example.com/x"
        );
    }

    #[test]
    fn test_request_spec_json() {
        let spec = RequestSpec::post("/cases")
            .with_json(&json!({"title": "case"}))
            .unwrap();
        assert_eq!(spec.method, Method::POST);
        assert_eq!(spec.headers[reqwest::header::CONTENT_TYPE], "application/json");
        assert_eq!(spec.body.unwrap(), Bytes::from(r#"{"title":"case"}"#));
    }

    #[test]
    fn test_rotated_credentials() {
        let mut response = TransportResponse::new(StatusCode::OK);
        assert_eq!(response.rotated_credentials(), None);

        response
            .headers
            .insert(TOKEN_REFRESHED_HEADER, HeaderValue::from_static("true"));
        response
            .headers
            .insert(NEW_ACCESS_TOKEN_HEADER, HeaderValue::from_static("a2"));
        // Half a pair is ignored
        assert_eq!(response.rotated_credentials(), None);

        response
            .headers
            .insert(NEW_REFRESH_TOKEN_HEADER, HeaderValue::from_static("r2"));
        assert_eq!(
            response.rotated_credentials(),
            Some(CredentialPair::new("a2", "r2"))
        );

        response
            .headers
            .insert(TOKEN_REFRESHED_HEADER, HeaderValue::from_static("false"));
        assert_eq!(response.rotated_credentials(), None);
    }

    #[tokio::test]
    async fn test_send_attaches_bearer_and_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v1/cases")
            .match_header("authorization", "Bearer token-1")
            .match_body(mockito::Matcher::Json(json!({"title": "case"})))
            .with_status(201)
            .with_header("x-request-id", "abc")
            .with_body(r#"{"id":7}"#)
            .create_async()
            .await;

        let transport =
            HttpRequestTransport::new(&format!("{}/api/v1", server.url()), 5, 5, 0).unwrap();
        let spec = RequestSpec::post("/cases")
            .with_json(&json!({"title": "case"}))
            .unwrap();
        let response = transport.send(&spec, "token-1", None).await.unwrap();

        assert_eq!(response.status, StatusCode::CREATED);
        assert_eq!(response.headers["x-request-id"], "abc");
        let body: serde_json::Value = response.json().unwrap();
        assert_eq!(body["id"], 7);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_send_retries_server_errors() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/flaky")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let transport = HttpRequestTransport::new(&server.url(), 5, 5, 2)
            .unwrap()
            .with_base_delay(1);
        let response = transport.send(&RequestSpec::get("/flaky"), "t", None).await.unwrap();

        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_send_does_not_retry_unauthorized() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/me")
            .with_status(401)
            .expect(1)
            .create_async()
            .await;

        let transport = HttpRequestTransport::new(&server.url(), 5, 5, 3)
            .unwrap()
            .with_base_delay(1);
        let response = transport.send(&RequestSpec::get("/me"), "t", None).await.unwrap();

        assert!(response.is_unauthorized());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_send_forwards_refresh_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/cases")
            .match_header("authorization", "Bearer a1")
            .match_header("x-refresh-token", "r1")
            .match_header("x-client", "cli")
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let transport = HttpRequestTransport::new(&server.url(), 5, 5, 0).unwrap();
        let spec = RequestSpec::get("/cases").with_header(
            HeaderName::from_static("x-client"),
            HeaderValue::from_static("cli"),
        );
        let response = transport.send(&spec, "a1", Some("r1")).await.unwrap();

        assert_eq!(response.status, StatusCode::OK);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_token_header_can_be_disabled() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/cases")
            .match_header("x-refresh-token", mockito::Matcher::Missing)
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let transport = HttpRequestTransport::new(&server.url(), 5, 5, 0)
            .unwrap()
            .with_refresh_token_header(false);
        transport
            .send(&RequestSpec::get("/cases"), "a1", Some("r1"))
            .await
            .unwrap();

        mock.assert_async().await;
    }
}
