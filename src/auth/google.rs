//! Google OAuth token refresh.
//!
//! The consent flow is an external collaborator's responsibility: it leaves
//! `client_secret.json` and a per-scope `<scope>_token.json` (holding the
//! long-lived refresh token) in the credentials directory. This provider
//! only exchanges the refresh token for a short-lived access token.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::Deserialize;

use crate::config::GoogleConfig;

use super::{Token, TokenProvider};

#[derive(Deserialize)]
struct ClientSecret {
    client_id: String,
    client_secret: String,
}

/// `client_secret.json` comes in two layouts depending on how the consent
/// flow exported it: bare, or nested under "installed"/"web".
#[derive(Deserialize)]
#[serde(untagged)]
enum ClientSecretFile {
    Nested {
        #[serde(alias = "web")]
        installed: ClientSecret,
    },
    Bare(ClientSecret),
}

#[derive(Deserialize)]
struct StoredToken {
    refresh_token: String,
}

#[derive(Deserialize)]
struct RefreshResponse {
    access_token: String,
    expires_in: i64,
}

/// Refreshes tokens for one Google credential scope.
pub struct GoogleTokenProvider {
    scope: String,
    credentials_dir: PathBuf,
    token_endpoint: String,
    http: reqwest::Client,
}

impl GoogleTokenProvider {
    pub fn new(scope: impl Into<String>, config: &GoogleConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.http_timeout_secs))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            scope: scope.into(),
            credentials_dir: config.credentials_dir.clone(),
            token_endpoint: config.token_endpoint.clone(),
            http,
        })
    }

    fn client_secret(&self) -> Result<ClientSecret> {
        let path = self.credentials_dir.join("client_secret.json");
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let parsed: ClientSecretFile = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(match parsed {
            ClientSecretFile::Nested { installed } => installed,
            ClientSecretFile::Bare(secret) => secret,
        })
    }

    fn stored_refresh_token(&self) -> Result<String> {
        let path = self.credentials_dir.join(format!("{}_token.json", self.scope));
        let content = std::fs::read_to_string(&path).with_context(|| {
            format!(
                "failed to read {} (run the consent flow for scope '{}' first)",
                path.display(),
                self.scope
            )
        })?;
        let stored: StoredToken = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(stored.refresh_token)
    }
}

#[async_trait]
impl TokenProvider for GoogleTokenProvider {
    fn scope(&self) -> &str {
        &self.scope
    }

    async fn refresh(&self) -> Result<Token> {
        let secret = self.client_secret()?;
        let refresh_token = self.stored_refresh_token()?;

        let response = self
            .http
            .post(&self.token_endpoint)
            .form(&[
                ("client_id", secret.client_id.as_str()),
                ("client_secret", secret.client_secret.as_str()),
                ("refresh_token", refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .context("token refresh request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("token refresh failed with {status}: {body}");
        }

        let refreshed: RefreshResponse = response
            .json()
            .await
            .context("token refresh returned malformed JSON")?;
        Ok(Token {
            access_token: refreshed.access_token,
            expires_at: Utc::now() + Duration::seconds(refreshed.expires_in),
        })
    }
}
