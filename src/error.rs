//! Error types for the OIDC session core

use std::io;

use thiserror::Error;

use crate::verifier::VerifyError;

/// Result type alias for the OIDC session core
pub type Result<T> = std::result::Result<T, Error>;

/// OIDC session errors
///
/// Errors raised inside a phase (code exchange, refresh, projection) are
/// wrapped in the matching phase variant before they reach the caller, so the
/// rendered message always starts with the phase that failed.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Authorization-code exchange failed
    #[error("token exchange: {0}")]
    CodeExchange(#[source] Box<Error>),

    /// Refresh-token exchange failed
    #[error("unable to redeem refresh token: {0}")]
    RefreshExchange(#[source] Box<Error>),

    /// A token bundle could not be projected into a session
    #[error("unable to update session: {0}")]
    SessionUpdate(#[source] Box<Error>),

    /// Userinfo lookup failed
    #[error("userinfo request: {0}")]
    Userinfo(#[source] Box<Error>),

    /// The token endpoint answered without an `id_token`
    #[error("token response missing identity token")]
    MissingIdToken,

    /// Identity token failed signature or claims validation
    #[error("could not verify identity token: {0}")]
    Verification(#[from] VerifyError),

    /// Verified claims did not have the expected shape
    #[error("failed to parse identity token claims: {0}")]
    ClaimsDecode(#[source] serde_json::Error),

    /// Verified claims carried no email address
    #[error("identity token did not contain an email")]
    MissingEmail,

    /// Verified claims flagged the email address as unverified
    #[error("email in identity token ({0}) isn't verified")]
    UnverifiedEmail(String),

    /// Userinfo response carried no email address
    #[error("userinfo response did not contain an email")]
    MissingUserinfoEmail,

    /// An endpoint answered with an error status or an unreadable body
    #[error("{operation} failed: HTTP {status} - {body}")]
    Endpoint {
        /// Which call failed
        operation: &'static str,
        /// HTTP status as received; a success status means the body was unreadable
        status: u16,
        /// Response body or decode message
        body: String,
    },

    /// A shared session was replaced while a refresh was in flight
    #[error("session changed during refresh (expected version {expected}, found {found})")]
    SessionConflict {
        /// Version the refresh started from
        expected: u64,
        /// Version found at commit time
        found: u64,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Coarse failure classes, stable across the phase wrappers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Request construction or network failure
    Transport,
    /// The token or userinfo endpoint rejected the call
    Exchange,
    /// Identity token failed cryptographic or claims validation
    Verification,
    /// Claims were valid but violate the identity policy
    Projection,
    /// Invalid or missing configuration
    Config,
    /// Concurrent writers raced on a shared session
    Conflict,
    /// Local IO or serialization failure
    Internal,
}

impl Error {
    /// Classify this error, looking through phase wrappers to the root cause.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CodeExchange(inner)
            | Self::RefreshExchange(inner)
            | Self::SessionUpdate(inner)
            | Self::Userinfo(inner) => inner.kind(),
            Self::Http(_) => ErrorKind::Transport,
            Self::Endpoint { .. } | Self::MissingUserinfoEmail => ErrorKind::Exchange,
            Self::Verification(_) => ErrorKind::Verification,
            Self::MissingIdToken
            | Self::ClaimsDecode(_)
            | Self::MissingEmail
            | Self::UnverifiedEmail(_) => ErrorKind::Projection,
            Self::Config(_) => ErrorKind::Config,
            Self::SessionConflict { .. } => ErrorKind::Conflict,
            Self::Io(_) | Self::Json(_) => ErrorKind::Internal,
        }
    }

    pub(crate) fn code_exchange(inner: Self) -> Self {
        Self::CodeExchange(Box::new(inner))
    }

    pub(crate) fn refresh_exchange(inner: Self) -> Self {
        Self::RefreshExchange(Box::new(inner))
    }

    pub(crate) fn session_update(inner: Self) -> Self {
        Self::SessionUpdate(Box::new(inner))
    }

    pub(crate) fn userinfo(inner: Self) -> Self {
        Self::Userinfo(Box::new(inner))
    }
}
