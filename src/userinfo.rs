//! Userinfo endpoint client: resolves an email address from an access token.

use reqwest::Client;
use reqwest::header::ACCEPT;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::exchange::ensure_success;
use crate::{Error, Result};

/// Fields read from the userinfo response.
#[derive(Debug, Deserialize)]
struct UserinfoResponse {
    #[serde(default)]
    email: Option<String>,
}

/// Calls a userinfo-style endpoint with bearer authentication.
pub struct UserinfoClient {
    http: Client,
    url: Url,
}

impl UserinfoClient {
    /// Create a client for `url`.
    #[must_use]
    pub fn new(url: Url) -> Self {
        Self {
            http: Client::new(),
            url,
        }
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(mut self, client: Client) -> Self {
        self.http = client;
        self
    }

    /// Endpoint URL.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Fetch the `email` field using `access_token` as the bearer credential.
    pub async fn fetch_email(&self, access_token: &str) -> Result<String> {
        debug!(url = %self.url, "Fetching userinfo");

        let response = self
            .http
            .get(self.url.clone())
            .bearer_auth(access_token)
            .header(ACCEPT, "application/json")
            .send()
            .await?;

        let response = ensure_success(response, "userinfo request").await?;
        let status = response.status().as_u16();
        let body = response.text().await?;

        let info: UserinfoResponse = serde_json::from_str(&body).map_err(|e| Error::Endpoint {
            operation: "userinfo request",
            status,
            body: format!("unreadable userinfo response: {e}"),
        })?;

        info.email
            .filter(|email| !email.is_empty())
            .ok_or(Error::MissingUserinfoEmail)
    }
}
