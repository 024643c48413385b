//! Group/role authorization over a session's identity token.
//!
//! # Design
//!
//! The policy is an immutable value built once from configuration and owned by
//! the provider. Every check re-verifies the identity token and re-reads the
//! role claim, so role changes at the identity provider apply on the next
//! check without waiting for a refresh.
//!
//! | Policy | Decision |
//! |--------|----------|
//! | none installed | allow |
//! | token fails verification | deny |
//! | role claim has the wrong shape | deny |
//! | any role in the allowed set | allow |
//! | otherwise | deny |

use std::collections::HashSet;
use std::fmt;

use tracing::{debug, warn};

use crate::claims::{RealmAccessRoles, RoleExtractor};
use crate::session::Session;
use crate::verifier::IdTokenVerifier;

/// Allowed role names plus the extractor that finds a user's roles.
pub struct GroupPolicy {
    allowed: HashSet<String>,
    extractor: Box<dyn RoleExtractor>,
}

impl GroupPolicy {
    /// Policy over Keycloak realm roles.
    #[must_use]
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_extractor(allowed, Box::new(RealmAccessRoles))
    }

    /// Policy reading roles with a custom extractor.
    #[must_use]
    pub fn with_extractor<I, S>(allowed: I, extractor: Box<dyn RoleExtractor>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: allowed.into_iter().map(Into::into).collect(),
            extractor,
        }
    }

    /// Whether any of `roles` is allowed.
    #[must_use]
    pub fn permits<S: AsRef<str>>(&self, roles: &[S]) -> bool {
        roles.iter().any(|role| self.allowed.contains(role.as_ref()))
    }

    /// Number of allowed role names.
    #[must_use]
    pub fn len(&self) -> usize {
        self.allowed.len()
    }

    /// Whether the allowed set is empty (such a policy denies everyone).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }
}

impl fmt::Debug for GroupPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut allowed: Vec<&String> = self.allowed.iter().collect();
        allowed.sort();
        f.debug_struct("GroupPolicy")
            .field("allowed", &allowed)
            .field("extractor", &self.extractor)
            .finish()
    }
}

/// Evaluate `policy` for `session`; `None` allows every session.
pub async fn authorize(
    policy: Option<&GroupPolicy>,
    verifier: &dyn IdTokenVerifier,
    session: &Session,
) -> bool {
    let Some(policy) = policy else {
        return true;
    };

    let claims = match verifier.verify(&session.id_token).await {
        Ok(claims) => claims,
        Err(e) => {
            warn!(error = %e, email = %session.email, "Could not verify identity token");
            return false;
        }
    };

    let roles = match policy.extractor.roles(&claims) {
        Ok(roles) => roles,
        Err(e) => {
            warn!(error = %e, email = %session.email, "Failed to parse role claims");
            return false;
        }
    };

    if policy.permits(&roles) {
        debug!(email = %session.email, "Group policy matched");
        return true;
    }

    warn!(email = %session.email, roles = ?roles, "User does not have required roles");
    false
}
