//! OpenID Connect provider: the session state machine.
//!
//! # Lifecycle
//!
//! ```text
//! code ──redeem──> TokenBundle ──project──> Session
//!                                             │
//!            ┌────────── refresh_if_needed ───┘
//!            │  fresh: no-op
//!            │  stale: refresh grant ─> project ─> commit
//!            ▼
//!         Session ──authorize──> bool
//!                 ──validate_session──> bool
//!                 ──fetch_email──> String
//! ```
//!
//! Every identity token, including the one returned by a refresh grant, is
//! verified before a session is built from it. A failed refresh never touches
//! the session it was asked to renew.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::authorizer::{self, GroupPolicy};
use crate::claims::{IdentityClaims, role_extractor_for};
use crate::config::{ProviderConfig, resolve_env_reference};
use crate::exchange::{HttpTokenClient, TokenBundle, TokenExchange};
use crate::session::{Session, SessionHandle, needs_refresh};
use crate::userinfo::UserinfoClient;
use crate::verifier::{IdTokenVerifier, JwtVerifier};
use crate::{Error, Result};

/// Rules applied when turning verified claims into a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProjectionPolicy {
    /// Treat a missing `email_verified` claim as unverified.
    ///
    /// Off by default: many providers omit the claim for addresses they
    /// manage themselves.
    pub require_email_verified: bool,
}

/// Session lifecycle for one OpenID Connect client registration.
pub struct OidcProvider {
    name: String,
    verifier: Arc<dyn IdTokenVerifier>,
    exchange: Arc<dyn TokenExchange>,
    userinfo: Option<UserinfoClient>,
    group_policy: Option<GroupPolicy>,
    projection: ProjectionPolicy,
}

impl OidcProvider {
    /// Start building a provider around a verifier and a token exchange client.
    #[must_use]
    pub fn builder(
        verifier: Arc<dyn IdTokenVerifier>,
        exchange: Arc<dyn TokenExchange>,
    ) -> OidcProviderBuilder {
        OidcProviderBuilder {
            name: "OpenID Connect".to_string(),
            verifier,
            exchange,
            userinfo: None,
            group_policy: None,
            projection: ProjectionPolicy::default(),
        }
    }

    /// Build the HTTP token client, the key-file verifier and the optional
    /// userinfo client and group policy from configuration.
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        config.validate()?;

        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()?;

        let mut verifier_config = config.verifier.clone();
        verifier_config.hmac_secret = verifier_config
            .hmac_secret
            .as_deref()
            .map(resolve_env_reference);
        let verifier = JwtVerifier::from_config(&config.issuer, &config.client_id, &verifier_config)
            .map_err(|e| Error::Config(e.to_string()))?;

        let exchange = HttpTokenClient::new(
            config.client_id.clone(),
            config.resolve_client_secret(),
            config.token_url()?,
        )
        .with_auth_method(config.client_auth_method)
        .with_http_client(http.clone());

        let mut builder = Self::builder(Arc::new(verifier), Arc::new(exchange))
            .name(config.provider_name.clone())
            .projection_policy(ProjectionPolicy {
                require_email_verified: config.require_email_verified,
            });

        if let Some(url) = config.userinfo_url()? {
            builder = builder.userinfo(UserinfoClient::new(url).with_http_client(http));
        }

        if !config.allowed_groups.is_empty() {
            builder = builder.group_policy(GroupPolicy::with_extractor(
                config.allowed_groups.iter().cloned(),
                role_extractor_for(&config.role_claim),
            ));
        }

        let provider = builder.build();
        info!(
            provider = %provider.name,
            group_policy = provider.group_policy.is_some(),
            "OIDC provider configured"
        );
        Ok(provider)
    }

    /// Display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Installed group policy, if any.
    #[must_use]
    pub fn group_policy(&self) -> Option<&GroupPolicy> {
        self.group_policy.as_ref()
    }

    /// Exchange an authorization code for a new session.
    pub async fn redeem(&self, redirect_url: &str, code: &str) -> Result<Session> {
        let bundle = self
            .exchange
            .exchange_code(code, redirect_url)
            .await
            .map_err(Error::code_exchange)?;

        let session = self.project(&bundle).await.map_err(Error::session_update)?;
        info!(email = %session.email, provider = %self.name, "Authorization code redeemed");
        Ok(session)
    }

    /// Verify the bundle's identity token and build a session from it.
    pub async fn project(&self, bundle: &TokenBundle) -> Result<Session> {
        let raw_id_token = bundle.id_token().ok_or(Error::MissingIdToken)?;

        let claims = self.verifier.verify(raw_id_token).await?;
        let identity: IdentityClaims = claims.decode().map_err(Error::ClaimsDecode)?;

        if identity.email.is_empty() {
            return Err(Error::MissingEmail);
        }
        let verified = identity
            .email_verified
            .unwrap_or(!self.projection.require_email_verified);
        if !verified {
            return Err(Error::UnverifiedEmail(identity.email));
        }

        Ok(Session {
            access_token: bundle.access_token.clone(),
            id_token: raw_id_token.to_string(),
            refresh_token: bundle.refresh_token.clone(),
            expires_on: bundle.expiry,
            email: identity.email,
        })
    }

    /// Produce a refreshed copy of `session` without modifying it.
    ///
    /// Returns `Ok(None)` when no refresh is needed or possible.
    pub async fn refresh(&self, session: &Session) -> Result<Option<Session>> {
        if !needs_refresh(Some(session), Utc::now()) {
            return Ok(None);
        }
        let Some(refresh_token) = session.refresh_token.as_deref() else {
            return Ok(None);
        };

        let bundle = self
            .exchange
            .exchange_refresh_token(refresh_token)
            .await
            .map_err(Error::refresh_exchange)?;

        let mut refreshed = self.project(&bundle).await.map_err(Error::session_update)?;
        // Providers may omit the refresh token on renewal; the old one stays valid.
        if refreshed.refresh_token.is_none() {
            refreshed.refresh_token = Some(refresh_token.to_string());
        }
        Ok(Some(refreshed))
    }

    /// Refresh `session` in place if it is stale.
    ///
    /// Returns `Ok(true)` when the session was replaced. On error the session
    /// is exactly as it was before the call.
    pub async fn refresh_if_needed(&self, session: &mut Session) -> Result<bool> {
        let previous_expiry = session.expires_on;
        match self.refresh(session).await {
            Ok(Some(refreshed)) => {
                session.commit(refreshed);
                info!(
                    email = %session.email,
                    expired_on = ?previous_expiry,
                    expires_on = ?session.expires_on,
                    "Refreshed session"
                );
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(e) => {
                warn!(error = %e, email = %session.email, "Session refresh failed");
                Err(e)
            }
        }
    }

    /// Refresh a shared session, committing only if no other writer did first.
    ///
    /// The network round trip runs without holding the session lock.
    pub async fn refresh_shared(&self, handle: &SessionHandle) -> Result<bool> {
        let snapshot = handle.snapshot();
        let refreshed = match self.refresh(&snapshot.session).await {
            Ok(Some(refreshed)) => refreshed,
            Ok(None) => return Ok(false),
            Err(e) => {
                warn!(error = %e, email = %snapshot.session.email, "Session refresh failed");
                return Err(e);
            }
        };

        let version = handle.commit(snapshot.version, refreshed)?;
        debug!(version, "Committed refreshed session");
        Ok(true)
    }

    /// Whether the session's identity token still verifies.
    pub async fn validate_session(&self, session: &Session) -> bool {
        match self.verifier.verify(&session.id_token).await {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, email = %session.email, "Session identity token no longer valid");
                false
            }
        }
    }

    /// Evaluate the group policy for `session`.
    pub async fn authorize(&self, session: &Session) -> bool {
        authorizer::authorize(self.group_policy.as_ref(), self.verifier.as_ref(), session).await
    }

    /// Look up the user's email at the userinfo endpoint.
    pub async fn fetch_email(&self, session: &Session) -> Result<String> {
        let userinfo = self
            .userinfo
            .as_ref()
            .ok_or_else(|| Error::Config("provider.userinfo_url is not configured".to_string()))?;

        userinfo
            .fetch_email(&session.access_token)
            .await
            .map_err(Error::userinfo)
    }
}

/// Builder for [`OidcProvider`].
pub struct OidcProviderBuilder {
    name: String,
    verifier: Arc<dyn IdTokenVerifier>,
    exchange: Arc<dyn TokenExchange>,
    userinfo: Option<UserinfoClient>,
    group_policy: Option<GroupPolicy>,
    projection: ProjectionPolicy,
}

impl OidcProviderBuilder {
    /// Override the display name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Enable email lookup through a userinfo endpoint.
    #[must_use]
    pub fn userinfo(mut self, client: UserinfoClient) -> Self {
        self.userinfo = Some(client);
        self
    }

    /// Install a group policy.
    #[must_use]
    pub fn group_policy(mut self, policy: GroupPolicy) -> Self {
        self.group_policy = Some(policy);
        self
    }

    /// Set the claim projection rules.
    #[must_use]
    pub fn projection_policy(mut self, policy: ProjectionPolicy) -> Self {
        self.projection = policy;
        self
    }

    /// Finish building.
    #[must_use]
    pub fn build(self) -> OidcProvider {
        OidcProvider {
            name: self.name,
            verifier: self.verifier,
            exchange: self.exchange,
            userinfo: self.userinfo,
            group_policy: self.group_policy,
            projection: self.projection,
        }
    }
}
