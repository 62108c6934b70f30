//! Service principal authentication against Microsoft Entra ID.
//!
//! Uses the OAuth2 client-credentials grant. Tokens are cached until shortly
//! before they expire, so a long deployment poll keeps working past the
//! first token's lifetime.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::CloudProviderError;

/// Public cloud login endpoint.
pub const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com";

/// Scope granting access to Azure Resource Manager.
pub const MANAGEMENT_SCOPE: &str = "https://management.azure.com/.default";

/// Refresh tokens this long before their reported expiry.
const EXPIRY_SLACK_SECS: i64 = 300;

/// Default timeout for token requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

/// An Entra ID application identity that can mint bearer tokens.
pub struct ServicePrincipal {
    client: Client,
    authority: String,
    tenant_id: String,
    client_id: String,
    client_secret: String,
    scope: String,
    cached: Mutex<Option<CachedToken>>,
}

impl std::fmt::Debug for ServicePrincipal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServicePrincipal")
            .field("authority", &self.authority)
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl ServicePrincipal {
    /// Create a service principal for the Resource Manager scope.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created or an identity field is empty.
    pub fn new(
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Result<Self, CloudProviderError> {
        let tenant_id = tenant_id.into();
        let client_id = client_id.into();
        let client_secret = client_secret.into();

        for (field, value) in [
            ("tenant id", &tenant_id),
            ("client id", &client_id),
            ("client secret", &client_secret),
        ] {
            if value.is_empty() {
                return Err(CloudProviderError::Config(format!("empty {field}")));
            }
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(CloudProviderError::Http)?;

        Ok(Self {
            client,
            authority: DEFAULT_AUTHORITY.to_string(),
            tenant_id,
            client_id,
            client_secret,
            scope: MANAGEMENT_SCOPE.to_string(),
            cached: Mutex::new(None),
        })
    }

    /// Use a different login endpoint (sovereign clouds, tests).
    #[must_use]
    pub fn with_authority(mut self, authority: impl Into<String>) -> Self {
        self.authority = authority.into().trim_end_matches('/').to_string();
        self
    }

    /// Request tokens for a different scope.
    #[must_use]
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    /// Return a valid bearer token, fetching a new one if needed.
    ///
    /// # Errors
    /// Returns [`CloudProviderError::Auth`] if the token endpoint rejects the
    /// credentials.
    pub async fn token(&self) -> Result<String, CloudProviderError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Utc::now() {
                return Ok(token.value.clone());
            }
        }

        let fresh = self.request_token().await?;
        let value = fresh.value.clone();
        *cached = Some(fresh);
        Ok(value)
    }

    async fn request_token(&self) -> Result<CachedToken, CloudProviderError> {
        let url = format!("{}/{}/oauth2/v2.0/token", self.authority, self.tenant_id);
        debug!(url = %url, client_id = %self.client_id, "Requesting access token");

        let response = self
            .client
            .post(&url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", self.scope.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(CloudProviderError::Auth(format!(
                "token request failed with {}: {text}",
                status.as_u16()
            )));
        }

        let token: TokenResponse = serde_json::from_str(&text)?;
        let lifetime = token.expires_in.unwrap_or(3600);
        let expires_at =
            Utc::now() + chrono::Duration::seconds((lifetime - EXPIRY_SLACK_SECS).max(0));

        Ok(CachedToken {
            value: token.access_token,
            expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_rejects_empty_secret() {
        let err = ServicePrincipal::new("tenant", "client", "").unwrap_err();
        assert!(err.to_string().contains("client secret"));
    }

    #[tokio::test]
    async fn test_token_is_cached() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tenant-1/oauth2/v2.0/token"))
            .and(body_string_contains("grant_type=client_credentials"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "token_type": "Bearer",
                "expires_in": 3599,
                "access_token": "tok-1"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let sp = ServicePrincipal::new("tenant-1", "client", "secret")
            .unwrap()
            .with_authority(server.uri());

        assert_eq!(sp.token().await.unwrap(), "tok-1");
        assert_eq!(sp.token().await.unwrap(), "tok-1");
    }

    #[tokio::test]
    async fn test_rejected_credentials_are_auth_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid_client"))
            .mount(&server)
            .await;

        let sp = ServicePrincipal::new("tenant-1", "client", "wrong")
            .unwrap()
            .with_authority(server.uri());

        let err = sp.token().await.unwrap_err();
        assert!(matches!(err, CloudProviderError::Auth(_)));
        assert!(err.to_string().contains("invalid_client"));
    }
}
