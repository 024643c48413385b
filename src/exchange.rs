//! Token endpoint client
//!
//! Implements the two grants the session core needs: `authorization_code`
//! (initial login) and `refresh_token` (session renewal). Client credentials
//! go in the form body (`client_secret_post`) unless the client is configured
//! for HTTP Basic authentication (`client_secret_basic`).

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::Client;
use reqwest::header::ACCEPT;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::debug;
use url::Url;

use crate::{Error, Result};

/// Tokens returned by a successful grant.
#[derive(Clone, PartialEq)]
pub struct TokenBundle {
    /// Access token
    pub access_token: String,
    /// Token type (usually "Bearer")
    pub token_type: String,
    /// Refresh token, when the provider issued one
    pub refresh_token: Option<String>,
    /// Absolute expiry declared by the token endpoint
    pub expiry: Option<DateTime<Utc>>,
    /// Every other response field; the identity token lives here as `id_token`
    pub extra: Map<String, JsonValue>,
}

impl TokenBundle {
    /// Bundle with only an access token.
    #[must_use]
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: default_token_type(),
            refresh_token: None,
            expiry: None,
            extra: Map::new(),
        }
    }

    /// Set the refresh token.
    #[must_use]
    pub fn with_refresh_token(mut self, token: impl Into<String>) -> Self {
        self.refresh_token = Some(token.into());
        self
    }

    /// Set the absolute expiry.
    #[must_use]
    pub fn with_expiry(mut self, expiry: DateTime<Utc>) -> Self {
        self.expiry = Some(expiry);
        self
    }

    /// Embed an identity token.
    #[must_use]
    pub fn with_id_token(mut self, token: impl Into<String>) -> Self {
        self.extra
            .insert("id_token".to_string(), JsonValue::String(token.into()));
        self
    }

    /// The embedded identity token, if the response carried one as a string.
    #[must_use]
    pub fn id_token(&self) -> Option<&str> {
        self.extra.get("id_token").and_then(JsonValue::as_str)
    }

    fn from_response(response: TokenResponse, received_at: DateTime<Utc>) -> Self {
        let expiry = response
            .expires_in
            .and_then(|secs| i64::try_from(secs).ok())
            .map(|secs| received_at + ChronoDuration::seconds(secs));

        Self {
            access_token: response.access_token,
            token_type: response.token_type.unwrap_or_else(default_token_type),
            refresh_token: response.refresh_token.filter(|t| !t.is_empty()),
            expiry,
            extra: response.extra,
        }
    }
}

impl fmt::Debug for TokenBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBundle")
            .field("token_type", &self.token_type)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("has_id_token", &self.id_token().is_some())
            .field("expiry", &self.expiry)
            .finish_non_exhaustive()
    }
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// OAuth token response
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default, deserialize_with = "deserialize_expires_in")]
    expires_in: Option<u64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(flatten)]
    extra: Map<String, JsonValue>,
}

/// `expires_in` as a JSON number or a numeric string (Azure AD v1 quotes it).
fn deserialize_expires_in<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ExpiresIn {
        Seconds(u64),
        Text(String),
    }

    match Option::<ExpiresIn>::deserialize(deserializer)? {
        None => Ok(None),
        Some(ExpiresIn::Seconds(secs)) => Ok(Some(secs)),
        Some(ExpiresIn::Text(raw)) if raw.trim().is_empty() => Ok(None),
        Some(ExpiresIn::Text(raw)) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| serde::de::Error::custom(format!("invalid expires_in {raw:?}: {e}"))),
    }
}

/// How the client authenticates to the token endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuthMethod {
    /// `client_id` and `client_secret` in the form body
    #[default]
    ClientSecretPost,
    /// HTTP Basic authentication with the client ID and secret
    ClientSecretBasic,
}

/// Performs the authorization-code and refresh-token grants.
#[async_trait]
pub trait TokenExchange: Send + Sync {
    /// Exchange an authorization code for tokens.
    async fn exchange_code(&self, code: &str, redirect_url: &str) -> Result<TokenBundle>;

    /// Redeem a refresh token.
    ///
    /// Always performs a real grant against the token endpoint; no cached
    /// token is ever returned.
    async fn exchange_refresh_token(&self, refresh_token: &str) -> Result<TokenBundle>;
}

/// [`TokenExchange`] over HTTP.
pub struct HttpTokenClient {
    http: Client,
    client_id: String,
    client_secret: Option<String>,
    token_url: Url,
    auth_method: ClientAuthMethod,
}

impl HttpTokenClient {
    /// Create a client for `token_url` with the given credentials.
    #[must_use]
    pub fn new(client_id: impl Into<String>, client_secret: Option<String>, token_url: Url) -> Self {
        Self {
            http: Client::new(),
            client_id: client_id.into(),
            client_secret,
            token_url,
            auth_method: ClientAuthMethod::default(),
        }
    }

    /// Choose how client credentials are presented.
    #[must_use]
    pub fn with_auth_method(mut self, method: ClientAuthMethod) -> Self {
        self.auth_method = method;
        self
    }

    /// Use a custom HTTP client (connection pool reuse, timeouts, testing).
    #[must_use]
    pub fn with_http_client(mut self, client: Client) -> Self {
        self.http = client;
        self
    }

    /// Token endpoint URL.
    #[must_use]
    pub fn token_url(&self) -> &Url {
        &self.token_url
    }

    async fn grant(&self, operation: &'static str, params: &[(&str, &str)]) -> Result<TokenBundle> {
        let mut form: Vec<(&str, &str)> = params.to_vec();
        let mut request = self
            .http
            .post(self.token_url.clone())
            .header(ACCEPT, "application/json");

        match (self.auth_method, self.client_secret.as_deref()) {
            (ClientAuthMethod::ClientSecretBasic, Some(secret)) => {
                request = request.basic_auth(&self.client_id, Some(secret));
            }
            (_, secret) => {
                form.push(("client_id", self.client_id.as_str()));
                if let Some(secret) = secret {
                    form.push(("client_secret", secret));
                }
            }
        }

        debug!(operation, url = %self.token_url, auth_method = ?self.auth_method, "Calling token endpoint");

        let response = request.form(&form).send().await?;

        let received_at = Utc::now();
        let response = ensure_success(response, operation).await?;
        let status = response.status().as_u16();
        let body = response.text().await?;

        let token_response: TokenResponse =
            serde_json::from_str(&body).map_err(|e| Error::Endpoint {
                operation,
                status,
                body: format!("unreadable token response: {e}"),
            })?;

        Ok(TokenBundle::from_response(token_response, received_at))
    }
}

#[async_trait]
impl TokenExchange for HttpTokenClient {
    async fn exchange_code(&self, code: &str, redirect_url: &str) -> Result<TokenBundle> {
        self.grant(
            "authorization code grant",
            &[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_url),
            ],
        )
        .await
    }

    async fn exchange_refresh_token(&self, refresh_token: &str) -> Result<TokenBundle> {
        self.grant(
            "refresh token grant",
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ],
        )
        .await
    }
}

/// Checks HTTP response status; returns the response on success or an error with details.
pub(crate) async fn ensure_success(
    response: reqwest::Response,
    operation: &'static str,
) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(Error::Endpoint {
        operation,
        status,
        body,
    })
}
