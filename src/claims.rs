//! Verified identity-token claims and role extraction.
//!
//! A [`ClaimSet`] is only ever produced by an [`IdTokenVerifier`]; holding one
//! means the signature, issuer, audience and expiry have been checked.
//!
//! Role extraction is provider-specific. Keycloak nests realm roles under
//! `realm_access.roles`, Azure AD and Okta use a flat `groups` claim, and
//! client roles live under `resource_access.<client>.roles`. A
//! [`RoleExtractor`] hides that difference from the authorizer.
//!
//! [`IdTokenVerifier`]: crate::verifier::IdTokenVerifier

use std::fmt;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

/// Decoded payload of a verified identity token.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimSet {
    inner: JsonValue,
}

impl ClaimSet {
    /// Wrap a verified claims object.
    #[must_use]
    pub fn new(inner: JsonValue) -> Self {
        Self { inner }
    }

    /// Decode the claims into a typed structure.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.inner)
    }

    /// Top-level claim by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&JsonValue> {
        self.inner.get(name)
    }

    /// Nested claim by dotted path, e.g. `resource_access.my-app.roles`.
    #[must_use]
    pub fn pointer(&self, dotted: &str) -> Option<&JsonValue> {
        let pointer: String = dotted
            .split('.')
            .map(|segment| format!("/{}", segment.replace('~', "~0").replace('/', "~1")))
            .collect();
        self.inner.pointer(&pointer)
    }

    /// The raw claims object.
    #[must_use]
    pub fn as_json(&self) -> &JsonValue {
        &self.inner
    }
}

/// The identity claims every session needs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IdentityClaims {
    /// Email address (empty when the claim is absent)
    #[serde(default)]
    pub email: String,
    /// Absent, `true` or `false`
    #[serde(default)]
    pub email_verified: Option<bool>,
}

/// Pulls the user's role names out of a verified claim set.
pub trait RoleExtractor: Send + Sync + fmt::Debug {
    /// Role names found in the claims.
    ///
    /// A missing claim yields an empty list; a claim of the wrong shape is an
    /// error.
    fn roles(&self, claims: &ClaimSet) -> Result<Vec<String>, serde_json::Error>;
}

/// Keycloak realm roles: `{"realm_access": {"roles": [...]}}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealmAccessRoles;

#[derive(Debug, Default, Deserialize)]
struct RealmAccessClaims {
    #[serde(default)]
    realm_access: RealmAccess,
}

#[derive(Debug, Default, Deserialize)]
struct RealmAccess {
    #[serde(default)]
    roles: Vec<String>,
}

impl RoleExtractor for RealmAccessRoles {
    fn roles(&self, claims: &ClaimSet) -> Result<Vec<String>, serde_json::Error> {
        let decoded: RealmAccessClaims = claims.decode()?;
        Ok(decoded.realm_access.roles)
    }
}

/// Roles at an arbitrary dotted claim path.
///
/// The value may be an array of strings or a single string.
#[derive(Debug, Clone)]
pub struct ClaimPathRoles {
    path: String,
}

impl ClaimPathRoles {
    /// Extract roles from `path` (e.g. `groups`).
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    /// The configured claim path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl RoleExtractor for ClaimPathRoles {
    fn roles(&self, claims: &ClaimSet) -> Result<Vec<String>, serde_json::Error> {
        match claims.pointer(&self.path) {
            None | Some(JsonValue::Null) => Ok(Vec::new()),
            Some(JsonValue::String(role)) => Ok(vec![role.clone()]),
            Some(value) => Vec::<String>::deserialize(value),
        }
    }
}

/// Build the extractor for a configured claim path.
///
/// `realm_access.roles` maps to the typed Keycloak extractor.
#[must_use]
pub fn role_extractor_for(path: &str) -> Box<dyn RoleExtractor> {
    if path == "realm_access.roles" {
        Box::new(RealmAccessRoles)
    } else {
        Box::new(ClaimPathRoles::new(path))
    }
}
