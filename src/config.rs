//! Configuration management

use std::{env, path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::exchange::ClientAuthMethod;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    /// Variables are set into the process environment for `${VAR}` resolution.
    #[serde(default)]
    pub env_files: Vec<String>,
    /// Identity provider configuration
    pub provider: ProviderConfig,
}

/// OpenID Connect provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Display name
    pub provider_name: String,
    /// OAuth client ID (also the expected identity-token audience)
    pub client_id: String,
    /// OAuth client secret (supports `env:VAR_NAME`)
    pub client_secret: Option<String>,
    /// How the client secret is presented to the token endpoint
    pub client_auth_method: ClientAuthMethod,
    /// Expected `iss` claim
    pub issuer: String,
    /// Token endpoint
    pub token_url: String,
    /// Userinfo endpoint (optional; needed only for email lookup)
    pub userinfo_url: Option<String>,
    /// Roles allowed through; empty disables group authorization
    pub allowed_groups: Vec<String>,
    /// Dotted claim path holding the user's roles
    pub role_claim: String,
    /// Reject identity tokens that omit `email_verified`
    pub require_email_verified: bool,
    /// Timeout applied to every token and userinfo request
    #[serde(with = "humantime_serde")]
    pub http_timeout: Duration,
    /// Identity-token verification keys
    pub verifier: VerifierConfig,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider_name: "OpenID Connect".to_string(),
            client_id: String::new(),
            client_secret: None,
            client_auth_method: ClientAuthMethod::default(),
            issuer: String::new(),
            token_url: String::new(),
            userinfo_url: None,
            allowed_groups: Vec::new(),
            role_claim: "realm_access.roles".to_string(),
            require_email_verified: false,
            http_timeout: Duration::from_secs(10),
            verifier: VerifierConfig::default(),
        }
    }
}

impl ProviderConfig {
    /// Resolve the client secret (expand `env:VAR_NAME`)
    #[must_use]
    pub fn resolve_client_secret(&self) -> Option<String> {
        self.client_secret.as_deref().map(resolve_env_reference)
    }

    /// Parsed token endpoint
    pub fn token_url(&self) -> Result<Url> {
        parse_url("token_url", &self.token_url)
    }

    /// Parsed userinfo endpoint, if configured
    pub fn userinfo_url(&self) -> Result<Option<Url>> {
        self.userinfo_url
            .as_deref()
            .map(|raw| parse_url("userinfo_url", raw))
            .transpose()
    }

    /// Check required settings
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first missing or malformed setting.
    pub fn validate(&self) -> Result<()> {
        if self.client_id.trim().is_empty() {
            return Err(Error::Config("provider.client_id is required".to_string()));
        }
        if self.issuer.trim().is_empty() {
            return Err(Error::Config("provider.issuer is required".to_string()));
        }
        self.token_url()?;
        self.userinfo_url()?;
        if !self.verifier.has_key_source() {
            return Err(Error::Config(
                "provider.verifier needs jwks_file, pem_files or hmac_secret".to_string(),
            ));
        }
        Ok(())
    }
}

/// Where identity-token verification keys come from
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    /// JWK set document on disk
    pub jwks_file: Option<PathBuf>,
    /// PEM public keys; the file stem is the key ID
    pub pem_files: Vec<PathBuf>,
    /// Shared secret for HS256 tokens (supports `env:VAR_NAME`)
    pub hmac_secret: Option<String>,
    /// Audiences accepted in addition to the client ID
    pub audiences: Vec<String>,
}

impl VerifierConfig {
    /// Whether any key source is configured
    #[must_use]
    pub fn has_key_source(&self) -> bool {
        self.jwks_file.is_some() || !self.pem_files.is_empty() || self.hmac_secret.is_some()
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        // Load from file if provided
        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (OIDC_SESSION_ prefix)
        figment = figment.merge(Env::prefixed("OIDC_SESSION_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Load env files into process environment (before env var expansion)
        config.load_env_files();

        config.expand_env_vars();

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => {
                        tracing::info!("Loaded env file: {expanded}");
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load env file {expanded}: {e}");
                    }
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in provider values
    fn expand_env_vars(&mut self) {
        // Pattern: ${VAR} or ${VAR:-default}
        let Ok(re) = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") else {
            return;
        };

        let provider = &mut self.provider;
        provider.issuer = Self::expand_string(&re, &provider.issuer);
        provider.token_url = Self::expand_string(&re, &provider.token_url);
        for value in [
            &mut provider.client_secret,
            &mut provider.userinfo_url,
            &mut provider.verifier.hmac_secret,
        ]
        .into_iter()
        .flatten()
        {
            *value = Self::expand_string(&re, value);
        }
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }
}

/// Resolve `env:VAR_NAME` references; other values pass through unchanged.
pub(crate) fn resolve_env_reference(value: &str) -> String {
    if let Some(var_name) = value.strip_prefix("env:") {
        env::var(var_name).unwrap_or_else(|_| value.to_string())
    } else {
        value.to_string()
    }
}

fn parse_url(setting: &str, raw: &str) -> Result<Url> {
    raw.parse()
        .map_err(|e| Error::Config(format!("provider.{setting} ({raw}): {e}")))
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else if let Some(mins) = s.strip_suffix('m') {
            let mins = mins.parse::<u64>().map_err(serde::de::Error::custom)?;
            mins.checked_mul(60)
                .map(Duration::from_secs)
                .ok_or_else(|| serde::de::Error::custom(format!("duration too large: {s}")))
        } else {
            // Assume seconds
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }
}
