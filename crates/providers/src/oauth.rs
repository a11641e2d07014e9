//! Cached OAuth credentials for the proxied Code Assist backend.
//!
//! The interactive sign-in flow is not handled here. A credential file
//! written by a previous sign-in is loaded, refreshed through the token
//! endpoint when it is about to expire, and written back.

use std::path::{Path, PathBuf};

use chrono::Utc;
use kestrel_core::ProviderError;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::http;

pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Refresh this long before the recorded expiry.
const EXPIRY_SKEW_MS: i64 = 60_000;

/// Contents of the credential file.
#[derive(Clone, Serialize, Deserialize)]
pub struct OAuthCredentials {
    pub access_token: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// Milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_date: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,

    /// Fields written by other tools are preserved on save.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl std::fmt::Debug for OAuthCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthCredentials")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expiry_date", &self.expiry_date)
            .finish()
    }
}

impl OAuthCredentials {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expiry_date
            .is_some_and(|expiry| expiry - EXPIRY_SKEW_MS <= now_ms)
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
}

/// Hands out valid access tokens from the credential file.
pub struct OAuthTokenSource {
    path: PathBuf,
    client_id: Option<String>,
    client_secret: Option<String>,
    token_url: String,
    client: reqwest::Client,
    cached: Mutex<Option<OAuthCredentials>>,
}

impl OAuthTokenSource {
    pub fn new(
        path: impl Into<PathBuf>,
        client_id: Option<String>,
        client_secret: Option<String>,
    ) -> Self {
        Self {
            path: path.into(),
            client_id,
            client_secret,
            token_url: GOOGLE_TOKEN_URL.into(),
            client: http::client(30),
            cached: Mutex::new(None),
        }
    }

    pub fn with_token_url(mut self, url: impl Into<String>) -> Self {
        self.token_url = url.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A currently valid access token, refreshing if needed.
    pub async fn access_token(&self) -> Result<String, ProviderError> {
        let mut cached = self.cached.lock().await;
        let creds = match cached.take() {
            Some(c) => c,
            None => load(&self.path).await?,
        };

        let creds = if creds.is_expired(Utc::now().timestamp_millis()) {
            let refreshed = self.refresh(creds).await?;
            save(&self.path, &refreshed).await?;
            refreshed
        } else {
            creds
        };

        let token = creds.access_token.clone();
        *cached = Some(creds);
        Ok(token)
    }

    async fn refresh(&self, creds: OAuthCredentials) -> Result<OAuthCredentials, ProviderError> {
        let Some(refresh_token) = creds.refresh_token.clone() else {
            return Err(ProviderError::AuthenticationFailed(
                "cached credentials expired and have no refresh token; sign in again".into(),
            ));
        };
        let (Some(client_id), Some(client_secret)) = (&self.client_id, &self.client_secret) else {
            return Err(ProviderError::NotConfigured(
                "oauth.client_id and oauth.client_secret are required to refresh credentials".into(),
            ));
        };

        debug!(token_url = %self.token_url, "Refreshing OAuth access token");
        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(http::network)?;
        let response = http::check_status("oauth", response).await?;
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Protocol(format!("bad token response: {e}")))?;

        info!("OAuth access token refreshed");
        Ok(OAuthCredentials {
            access_token: token.access_token,
            refresh_token: token.refresh_token.or(Some(refresh_token)),
            expiry_date: token
                .expires_in
                .map(|secs| Utc::now().timestamp_millis() + secs * 1000),
            token_type: token.token_type.or(creds.token_type),
            extra: creds.extra,
        })
    }
}

async fn load(path: &Path) -> Result<OAuthCredentials, ProviderError> {
    let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
        ProviderError::AuthenticationFailed(format!(
            "no cached OAuth credentials at {}: {e}",
            path.display()
        ))
    })?;
    serde_json::from_str(&raw).map_err(|e| {
        ProviderError::AuthenticationFailed(format!(
            "invalid OAuth credential file {}: {e}",
            path.display()
        ))
    })
}

async fn save(path: &Path, creds: &OAuthCredentials) -> Result<(), ProviderError> {
    let json = serde_json::to_string_pretty(creds)
        .map_err(|e| ProviderError::Protocol(e.to_string()))?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ProviderError::NotConfigured(e.to_string()))?;
    }
    tokio::fs::write(path, json)
        .await
        .map_err(|e| ProviderError::NotConfigured(format!("cannot write {}: {e}", path.display())))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn write_creds(dir: &Path, value: serde_json::Value) -> PathBuf {
        let path = dir.join("oauth_creds.json");
        std::fs::write(&path, value.to_string()).unwrap();
        path
    }

    #[test]
    fn expiry_respects_skew() {
        let creds: OAuthCredentials =
            serde_json::from_value(json!({ "access_token": "a", "expiry_date": 100_000 })).unwrap();
        assert!(!creds.is_expired(0));
        assert!(creds.is_expired(50_000));

        let no_expiry: OAuthCredentials =
            serde_json::from_value(json!({ "access_token": "a" })).unwrap();
        assert!(!no_expiry.is_expired(i64::MAX));
    }

    #[tokio::test]
    async fn valid_token_used_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let far_future = Utc::now().timestamp_millis() + 3_600_000;
        let path = write_creds(dir.path(), json!({ "access_token": "tok", "expiry_date": far_future }));

        let source = OAuthTokenSource::new(path, None, None).with_token_url("http://127.0.0.1:9");
        assert_eq!(source.access_token().await.unwrap(), "tok");
        assert_eq!(source.access_token().await.unwrap(), "tok");
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_and_saved() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_creds(
            dir.path(),
            json!({ "access_token": "old", "refresh_token": "r1", "expiry_date": 0, "scope": "x" }),
        );
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(wiremock::matchers::path("/token"))
            .and(body_string_contains("refresh_token=r1"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "access_token": "new", "expires_in": 3600 })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let source = OAuthTokenSource::new(&path, Some("id".into()), Some("secret".into()))
            .with_token_url(format!("{}/token", server.uri()));
        assert_eq!(source.access_token().await.unwrap(), "new");

        let saved: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved["access_token"], "new");
        assert_eq!(saved["refresh_token"], "r1");
        assert_eq!(saved["scope"], "x");
    }

    #[tokio::test]
    async fn missing_file_is_auth_failure() {
        let source = OAuthTokenSource::new("/nonexistent/creds.json", None, None);
        let err = source.access_token().await.unwrap_err();
        assert!(matches!(err, ProviderError::AuthenticationFailed(_)));
    }

    #[tokio::test]
    async fn expired_without_client_secret_is_not_configured() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_creds(
            dir.path(),
            json!({ "access_token": "old", "refresh_token": "r1", "expiry_date": 0 }),
        );
        let source = OAuthTokenSource::new(path, None, None);
        let err = source.access_token().await.unwrap_err();
        assert!(matches!(err, ProviderError::NotConfigured(_)));
    }

    #[test]
    fn debug_redacts_tokens() {
        let creds: OAuthCredentials =
            serde_json::from_value(json!({ "access_token": "sekrit", "refresh_token": "r" })).unwrap();
        assert!(!format!("{creds:?}").contains("sekrit"));
    }
}
