//! Credentials and session-token lifecycle.

use crate::error::{Error, Result};
use serde_json::Value;
use std::env;
use std::time::{Duration, Instant};

/// Tokens are refreshed this long before their stated expiry.
pub(crate) const REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Immutable API credentials plus the exchange base URL, loaded once.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
    pub base_url: String,
}

impl Credentials {
    /// Read `DERIBIT_API_KEY`, `DERIBIT_API_SECRET` and `DERIBIT_BASE_URL`
    /// from the environment. Fails fast when any is missing or empty.
    pub fn from_env() -> Result<Self> {
        Self::new(
            env::var("DERIBIT_API_KEY").unwrap_or_default(),
            env::var("DERIBIT_API_SECRET").unwrap_or_default(),
            env::var("DERIBIT_BASE_URL").unwrap_or_default(),
        )
    }

    pub fn new(
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self> {
        let credentials = Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            base_url: base_url.into(),
        };
        if credentials.api_key.is_empty() || credentials.api_secret.is_empty() {
            return Err(Error::Config(
                "API credentials not found in environment".to_string(),
            ));
        }
        if credentials.base_url.is_empty() {
            return Err(Error::Config("DERIBIT_BASE_URL not set".to_string()));
        }
        Ok(credentials)
    }

    /// Endpoint for `public/auth` (no method suffix).
    pub fn rpc_root(&self) -> String {
        format!("{}/api/v2", self.base_url)
    }

    /// Endpoint for a named JSON-RPC method.
    pub fn rpc_url(&self, method: &str) -> String {
        format!("{}/api/v2/{}", self.base_url, method)
    }
}

/// Mutable bearer-token state, owned by the dispatcher worker.
#[derive(Debug, Clone)]
pub(crate) struct SessionToken {
    pub access_token: String,
    #[allow(dead_code)]
    pub refresh_token: String,
    pub expires_in: u64,
    pub issued_at: Instant,
}

impl SessionToken {
    /// Extract a token from a `public/auth` response body.
    pub fn from_response(response: &Value) -> Option<Self> {
        let result = response.get("result")?;
        Some(Self {
            access_token: result.get("access_token")?.as_str()?.to_string(),
            refresh_token: result
                .get("refresh_token")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            expires_in: result.get("expires_in")?.as_u64()?,
            issued_at: Instant::now(),
        })
    }

    /// A token is usable only while `now - issued_at < expires_in - 60 s`.
    pub fn is_fresh(&self) -> bool {
        let lifetime = Duration::from_secs(self.expires_in).saturating_sub(REFRESH_MARGIN);
        self.issued_at.elapsed() < lifetime
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_credentials_fail_construction() {
        assert!(matches!(
            Credentials::new("", "secret", "https://x"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Credentials::new("key", "", "https://x"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Credentials::new("key", "secret", ""),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn rpc_urls() {
        let credentials =
            Credentials::new("key", "secret", "https://test.deribit.com").unwrap();
        assert_eq!(credentials.rpc_root(), "https://test.deribit.com/api/v2");
        assert_eq!(
            credentials.rpc_url("private/get_positions"),
            "https://test.deribit.com/api/v2/private/get_positions"
        );
    }

    #[test]
    fn token_parses_auth_response() {
        let response = json!({
            "result": {
                "access_token": "T",
                "refresh_token": "R",
                "expires_in": 900
            }
        });
        let token = SessionToken::from_response(&response).unwrap();
        assert_eq!(token.access_token, "T");
        assert_eq!(token.refresh_token, "R");
        assert_eq!(token.expires_in, 900);
        assert!(token.is_fresh());
    }

    #[test]
    fn token_without_result_is_rejected() {
        let response = json!({"error": {"message": "invalid_credentials"}});
        assert!(SessionToken::from_response(&response).is_none());
    }

    #[test]
    fn short_lived_token_is_immediately_stale() {
        // expires_in inside the refresh margin leaves no usable lifetime.
        let response = json!({
            "result": {"access_token": "T", "refresh_token": "R", "expires_in": 60}
        });
        let token = SessionToken::from_response(&response).unwrap();
        assert!(!token.is_fresh());
    }
}
