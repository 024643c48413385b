//! Session record and single-writer commit helpers.
//!
//! A [`Session`] is plain data: the refresh coordinator never edits one field
//! at a time. It computes a complete replacement snapshot and applies it with
//! [`Session::commit`], so a reader can never observe a new access token next
//! to a stale email.
//!
//! [`SessionHandle`] is for sessions shared across tasks. Readers take cheap
//! snapshots; a writer commits with the version it started from and loses the
//! race cleanly if another writer got there first.

use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Authenticated identity for one user and one provider.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Bearer credential for resource and userinfo calls
    pub access_token: String,
    /// Raw identity token, verified when the session was built
    pub id_token: String,
    /// Credential for renewing the session; absent means it simply expires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Expiry declared by the token endpoint; `None` is treated as expired
    #[serde(default)]
    pub expires_on: Option<DateTime<Utc>>,
    /// Verified email address
    pub email: String,
}

impl Session {
    /// Whether the access token should be treated as stale at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_on.is_none_or(|expires_on| expires_on <= now)
    }

    /// Whether a refresh grant is possible at all.
    #[must_use]
    pub fn can_refresh(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// Replace every mutable field with the values from a refreshed snapshot.
    pub fn commit(&mut self, refreshed: Session) {
        *self = refreshed;
    }

    /// Read a session from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Write the session to `path` as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut content = serde_json::to_string_pretty(self)?;
        content.push('\n');
        fs::write(path, content)?;
        Ok(())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("email", &self.email)
            .field("expires_on", &self.expires_on)
            .field("has_refresh_token", &self.can_refresh())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.expires_on {
            Some(expires_on) => write!(f, "Session{{{} expires:{}}}", self.email, expires_on),
            None => write!(f, "Session{{{}}}", self.email),
        }
    }
}

/// Decide whether `session` must be refreshed at `now`.
///
/// A missing session, a session that has not expired yet, and a session
/// without a refresh token are all left alone.
#[must_use]
pub fn needs_refresh(session: Option<&Session>, now: DateTime<Utc>) -> bool {
    match session {
        None => false,
        Some(session) => session.is_expired_at(now) && session.can_refresh(),
    }
}

/// A session value tagged with the number of commits applied to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    /// Commit counter, starting at 0
    pub version: u64,
    /// Session contents at that version
    pub session: Session,
}

/// Shared, versioned session cell.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    inner: Arc<RwLock<Versioned>>,
}

impl SessionHandle {
    /// Wrap a session at version 0.
    #[must_use]
    pub fn new(session: Session) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Versioned {
                version: 0,
                session,
            })),
        }
    }

    /// Copy of the current session and its version.
    #[must_use]
    pub fn snapshot(&self) -> Versioned {
        self.inner.read().clone()
    }

    /// Current version.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.inner.read().version
    }

    /// Install `refreshed` if nobody committed since `expected_version`.
    ///
    /// Returns the new version. On conflict the stored session is untouched.
    pub fn commit(&self, expected_version: u64, refreshed: Session) -> Result<u64> {
        let mut guard = self.inner.write();
        if guard.version != expected_version {
            return Err(Error::SessionConflict {
                expected: expected_version,
                found: guard.version,
            });
        }
        guard.session.commit(refreshed);
        guard.version += 1;
        Ok(guard.version)
    }
}
