//! OIDC Session Library
//!
//! OpenID Connect session lifecycle for a reverse proxy sitting in front of
//! upstream applications.
//!
//! # Features
//!
//! - **Code Exchange**: Redeem an authorization code for a verified session
//! - **Identity Verification**: Every identity token is checked against local keys
//!   (JWKS file, PEM files or a shared HMAC secret) before it is trusted
//! - **Refresh**: Stale sessions are renewed with the refresh grant and replaced
//!   atomically; a failed refresh leaves the session untouched
//! - **Group Authorization**: Optional allow-list over Keycloak realm roles or any
//!   dotted claim path
//! - **Userinfo**: Email lookup with the session's access token
//!
//! # Example
//!
//! ```no_run
//! use oidc_session::{OidcProvider, config::Config};
//!
//! # async fn run() -> oidc_session::Result<()> {
//! let config = Config::load(Some(std::path::Path::new("oidc-session.yaml")))?;
//! let provider = OidcProvider::from_config(&config.provider)?;
//!
//! let mut session = provider.redeem("https://app.example.com/oauth2/callback", "abc123").await?;
//! provider.refresh_if_needed(&mut session).await?;
//! assert!(provider.authorize(&session).await);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod authorizer;
pub mod claims;
pub mod cli;
pub mod config;
pub mod error;
pub mod exchange;
pub mod provider;
pub mod session;
pub mod userinfo;
pub mod verifier;

pub use authorizer::GroupPolicy;
pub use claims::{ClaimPathRoles, ClaimSet, RealmAccessRoles, RoleExtractor};
pub use error::{Error, ErrorKind, Result};
pub use exchange::{HttpTokenClient, TokenBundle, TokenExchange};
pub use provider::{OidcProvider, OidcProviderBuilder, ProjectionPolicy};
pub use session::{Session, SessionHandle, needs_refresh};
pub use userinfo::UserinfoClient;
pub use verifier::{IdTokenVerifier, JwtVerifier, VerifyError};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` overrides `level` when set. `format` of `"json"` selects
/// structured output; anything else is human-readable text on stderr.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let init = match format {
        Some("json") => subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        _ => subscriber
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init(),
    };

    init.map_err(|e| Error::Config(format!("failed to install tracing subscriber: {e}")))
}
