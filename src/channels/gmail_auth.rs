//! Gmail access tokens: a static bearer token, or an authorized-user token
//! file that can be refreshed with its refresh token.
//!
//! The interactive consent flow is not implemented: the token file must
//! already exist (as written by Google's installed-app flow).

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::SourceError;

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Tokens are treated as expired this long before their stated expiry.
const EXPIRY_SKEW_SECS: i64 = 60;

/// On-disk authorized-user credentials. Unknown fields are preserved when
/// the file is rewritten.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TokenFile {
    fn can_refresh(&self) -> bool {
        self.refresh_token.is_some() && self.client_id.is_some() && self.client_secret.is_some()
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expiry {
            Some(expiry) => expiry - ChronoDuration::seconds(EXPIRY_SKEW_SECS) <= now,
            None => false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    expires_in: Option<i64>,
}

/// Holds the current Gmail access token and refreshes it on demand.
pub struct TokenStore {
    http: reqwest::Client,
    path: Option<PathBuf>,
    state: Mutex<TokenFile>,
}

impl TokenStore {
    /// A fixed bearer token with no refresh capability.
    pub fn from_access_token(token: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            path: None,
            state: Mutex::new(TokenFile {
                token: Some(token.to_string()),
                ..Default::default()
            }),
        }
    }

    /// Load an authorized-user token file.
    pub fn load(path: &Path) -> Result<Self, SourceError> {
        let raw = std::fs::read_to_string(path).map_err(|e| SourceError::AuthFailed {
            name: "gmail".into(),
            reason: format!("cannot read token file {}: {e}", path.display()),
        })?;
        let file: TokenFile = serde_json::from_str(&raw).map_err(|e| SourceError::AuthFailed {
            name: "gmail".into(),
            reason: format!("invalid token file {}: {e}", path.display()),
        })?;
        if file.token.is_none() && !file.can_refresh() {
            return Err(SourceError::AuthFailed {
                name: "gmail".into(),
                reason: format!(
                    "token file {} has neither a token nor refresh credentials",
                    path.display()
                ),
            });
        }
        Ok(Self {
            http: reqwest::Client::new(),
            path: Some(path.to_path_buf()),
            state: Mutex::new(file),
        })
    }

    /// Whether a rejected token can be replaced by [`TokenStore::refresh`].
    pub async fn can_refresh(&self) -> bool {
        self.state.lock().await.can_refresh()
    }

    /// Current access token, refreshed first if it is missing or expired.
    pub async fn access_token(&self) -> Result<SecretString, SourceError> {
        {
            let state = self.state.lock().await;
            if let Some(token) = &state.token
                && !state.is_expired(Utc::now())
            {
                return Ok(SecretString::from(token.clone()));
            }
        }
        debug!("Gmail access token missing or expired, refreshing");
        self.refresh().await
    }

    /// Exchange the refresh token for a new access token and persist it.
    pub async fn refresh(&self) -> Result<SecretString, SourceError> {
        let mut state = self.state.lock().await;
        let (Some(refresh_token), Some(client_id), Some(client_secret)) = (
            state.refresh_token.clone(),
            state.client_id.clone(),
            state.client_secret.clone(),
        ) else {
            return Err(SourceError::AuthFailed {
                name: "gmail".into(),
                reason: "access token rejected and no refresh credentials available".into(),
            });
        };
        let token_uri = state
            .token_uri
            .clone()
            .unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string());

        let response = self
            .http
            .post(&token_uri)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| SourceError::AuthFailed {
                name: "gmail".into(),
                reason: format!("token refresh request failed: {e}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::AuthFailed {
                name: "gmail".into(),
                reason: format!("token refresh rejected ({status}): {body}"),
            });
        }

        let refreshed: RefreshResponse =
            response.json().await.map_err(|e| SourceError::AuthFailed {
                name: "gmail".into(),
                reason: format!("invalid token refresh response: {e}"),
            })?;

        state.token = Some(refreshed.access_token.clone());
        state.expiry = refreshed
            .expires_in
            .map(|secs| Utc::now() + ChronoDuration::seconds(secs));
        info!("Refreshed Gmail access token");

        if let Some(path) = &self.path {
            match serde_json::to_string_pretty(&*state) {
                Ok(json) => {
                    if let Err(e) = std::fs::write(path, json) {
                        warn!(path = %path.display(), error = %e, "Failed to persist refreshed token");
                    }
                }
                Err(e) => warn!(error = %e, "Failed to serialize refreshed token"),
            }
        }

        Ok(SecretString::from(refreshed.access_token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn write_token_file(dir: &tempfile::TempDir, json: &str) -> PathBuf {
        let path = dir.path().join("token.json");
        std::fs::write(&path, json).unwrap();
        path
    }

    #[tokio::test]
    async fn static_token_is_returned_as_is() {
        let store = TokenStore::from_access_token("abc");
        let token = store.access_token().await.unwrap();
        assert_eq!(token.expose_secret(), "abc");
        assert!(!store.can_refresh().await);
    }

    #[tokio::test]
    async fn static_token_cannot_refresh() {
        let store = TokenStore::from_access_token("abc");
        let err = store.refresh().await.unwrap_err();
        assert!(matches!(err, SourceError::AuthFailed { .. }));
    }

    #[test]
    fn load_rejects_file_without_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_token_file(&dir, r#"{"scopes": ["x"]}"#);
        assert!(TokenStore::load(&path).is_err());
    }

    #[test]
    fn load_missing_file_is_auth_error() {
        let err = TokenStore::load(Path::new("/nonexistent/token.json"))
            .err()
            .unwrap();
        assert!(err.to_string().contains("cannot read token file"));
    }

    #[tokio::test]
    async fn unexpired_token_from_file_is_used() {
        let dir = tempfile::tempdir().unwrap();
        let expiry = (Utc::now() + ChronoDuration::hours(1)).to_rfc3339();
        let path = write_token_file(
            &dir,
            &format!(r#"{{"token": "live", "expiry": "{expiry}"}}"#),
        );
        let store = TokenStore::load(&path).unwrap();
        assert_eq!(store.access_token().await.unwrap().expose_secret(), "live");
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_and_persisted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=r1"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"{"access_token": "fresh", "expires_in": 3599, "token_type": "Bearer"}"#,
                "application/json",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let path = write_token_file(
            &dir,
            &format!(
                r#"{{
                    "token": "stale",
                    "refresh_token": "r1",
                    "client_id": "cid",
                    "client_secret": "secret",
                    "token_uri": "{}/token",
                    "expiry": "2020-01-01T00:00:00Z",
                    "scopes": ["https://www.googleapis.com/auth/gmail.modify"]
                }}"#,
                server.uri()
            ),
        );

        let store = TokenStore::load(&path).unwrap();
        assert!(store.can_refresh().await);
        assert_eq!(store.access_token().await.unwrap().expose_secret(), "fresh");

        let saved: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved["token"], "fresh");
        assert_eq!(saved["refresh_token"], "r1");
        assert!(saved["scopes"].is_array());
    }

    #[tokio::test]
    async fn rejected_refresh_is_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let path = write_token_file(
            &dir,
            &format!(
                r#"{{"refresh_token": "r1", "client_id": "c", "client_secret": "s", "token_uri": "{}/token"}}"#,
                server.uri()
            ),
        );
        let store = TokenStore::load(&path).unwrap();
        let err = store.access_token().await.unwrap_err();
        assert!(err.to_string().contains("invalid_grant"));
    }
}
