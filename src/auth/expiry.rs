// Token expiry extraction
// The coordinator never looks inside tokens; it asks an ExpiryExtractor

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};

/// Decodes the expiry instant of an opaque token
///
/// `None` means the expiry is unknown, which the coordinator treats as expired.
pub trait ExpiryExtractor: Send + Sync {
    fn expires_at(&self, token: &str) -> Option<DateTime<Utc>>;
}

impl<F> ExpiryExtractor for F
where
    F: Fn(&str) -> Option<DateTime<Utc>> + Send + Sync,
{
    fn expires_at(&self, token: &str) -> Option<DateTime<Utc>> {
        self(token)
    }
}

/// Reads the `exp` claim from an unverified JWT payload
///
/// Signatures are not checked. The backend remains the authority on whether
/// a token is accepted; this only decides when to refresh.
#[derive(Debug, Clone, Copy, Default)]
pub struct JwtExpiry;

impl ExpiryExtractor for JwtExpiry {
    fn expires_at(&self, token: &str) -> Option<DateTime<Utc>> {
        let payload = token.split('.').nth(1)?;
        let bytes = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .ok()?;
        let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
        let exp = claims.get("exp")?;
        let secs = exp
            .as_i64()
            .or_else(|| exp.as_f64().map(|f| f.floor() as i64))?;
        DateTime::from_timestamp(secs, 0)
    }
}

#[cfg(test)]
pub(crate) fn encode_test_jwt(sub: &str, exp: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"{}","exp":{}}}"#, sub, exp));
    format!("{}.{}.signature", header, payload)
}
