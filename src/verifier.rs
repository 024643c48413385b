//! Identity-token verification: JWT signature and claims validation.
//!
//! # Verification flow
//!
//! 1. Decode the JWT header (no verification) to extract `kid` and `alg`.
//! 2. Pick the configured key for that `kid` (a single key without a `kid`
//!    matches every token).
//! 3. Verify the signature and the standard time claims (`exp`, `nbf`) with a
//!    60 second leeway.
//! 4. Require `iss` to equal the configured issuer and `aud` to contain one of
//!    the accepted audiences.
//! 5. Return the full payload as a [`ClaimSet`].
//!
//! Keys are loaded from local material only (a JWK set file, PEM files or a
//! shared HMAC secret). Discovery and remote JWKS retrieval are left to the
//! deployment, which is expected to keep the key file current.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use async_trait::async_trait;
use jsonwebtoken::{
    Algorithm, DecodingKey, Validation,
    jwk::{AlgorithmParameters, JwkSet},
};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::claims::ClaimSet;
use crate::config::VerifierConfig;

/// Clock skew tolerated between the identity provider and this host.
const LEEWAY_SECS: u64 = 60;

/// Error variants for identity-token verification failures.
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    /// JWT decode / signature / time-claim verification failed.
    #[error("JWT verification failed: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// The `kid` in the JWT header matches no configured key.
    #[error("Unknown key ID: {0}")]
    UnknownKeyId(String),

    /// The token is signed with an algorithm the selected key cannot verify.
    #[error("Algorithm {0:?} not accepted for this key")]
    AlgorithmNotAllowed(Algorithm),

    /// The token's `iss` claim does not match the configured issuer.
    #[error("Issuer mismatch: expected {expected}, got {actual}")]
    IssuerMismatch {
        /// Expected issuer URL.
        expected: String,
        /// Actual issuer found in the token.
        actual: String,
    },

    /// The token's `aud` claim names none of the accepted audiences.
    #[error("Audience not accepted: {0}")]
    AudienceMismatch(String),

    /// No verification keys are configured.
    #[error("No verification keys configured")]
    NoKeys,

    /// Key material could not be read or parsed.
    #[error("Failed to load verification key {source_name}: {reason}")]
    KeyLoad {
        /// File or setting the key came from.
        source_name: String,
        /// Why loading failed.
        reason: String,
    },
}

/// Verifies a raw identity token and returns its claims.
#[async_trait]
pub trait IdTokenVerifier: Send + Sync {
    /// Verify `raw` and return its decoded claims.
    async fn verify(&self, raw: &str) -> Result<ClaimSet, VerifyError>;
}

/// A decoding key together with the algorithms it may verify.
struct VerificationKey {
    key: DecodingKey,
    algorithms: Vec<Algorithm>,
}

/// [`IdTokenVerifier`] backed by `jsonwebtoken` and locally supplied keys.
///
/// ```
/// # use oidc_session::{IdTokenVerifier, JwtVerifier};
/// # use jsonwebtoken::{Algorithm, EncodingKey, Header};
/// # tokio_test::block_on(async {
/// let verifier = JwtVerifier::new("https://sso.example.com", vec!["my-proxy".into()])
///     .with_hmac_secret(b"shared-secret");
///
/// let claims = serde_json::json!({
///     "iss": "https://sso.example.com",
///     "aud": "my-proxy",
///     "exp": chrono::Utc::now().timestamp() + 60,
///     "email": "alice@example.com",
/// });
/// let token = jsonwebtoken::encode(
///     &Header::new(Algorithm::HS256),
///     &claims,
///     &EncodingKey::from_secret(b"shared-secret"),
/// )
/// .unwrap();
///
/// let verified = verifier.verify(&token).await.unwrap();
/// assert_eq!(verified.get("email").unwrap(), "alice@example.com");
/// # });
/// ```
pub struct JwtVerifier {
    issuer: String,
    audiences: Vec<String>,
    /// Keys by `kid`; `None` is the key used when the token carries no `kid`
    /// or when it is the only key configured.
    keys: HashMap<Option<String>, VerificationKey>,
}

impl JwtVerifier {
    /// Create a verifier for `issuer` accepting tokens addressed to any of
    /// `audiences`.
    #[must_use]
    pub fn new(issuer: impl Into<String>, audiences: Vec<String>) -> Self {
        Self {
            issuer: issuer.into(),
            audiences,
            keys: HashMap::new(),
        }
    }

    /// Build from configuration: loads every configured key source.
    ///
    /// The client ID is always an accepted audience.
    pub fn from_config(
        issuer: &str,
        client_id: &str,
        config: &VerifierConfig,
    ) -> Result<Self, VerifyError> {
        let mut audiences = vec![client_id.to_string()];
        audiences.extend(config.audiences.iter().cloned());

        let mut verifier = Self::new(issuer, audiences);

        if let Some(path) = &config.jwks_file {
            verifier = verifier.with_jwks_file(path)?;
        }
        for path in &config.pem_files {
            verifier = verifier.with_pem_file(path)?;
        }
        if let Some(secret) = &config.hmac_secret {
            verifier = verifier.with_hmac_secret(secret.as_bytes());
        }

        if verifier.keys.is_empty() {
            return Err(VerifyError::NoKeys);
        }
        Ok(verifier)
    }

    /// Add a shared-secret key (HS256/384/512), matched when the token has no
    /// `kid` or when it is the only key.
    #[must_use]
    pub fn with_hmac_secret(mut self, secret: &[u8]) -> Self {
        self.keys.insert(
            None,
            VerificationKey {
                key: DecodingKey::from_secret(secret),
                algorithms: vec![Algorithm::HS256, Algorithm::HS384, Algorithm::HS512],
            },
        );
        self
    }

    /// Add every usable key from a JWK set document.
    pub fn with_jwks(mut self, jwks: &JwkSet) -> Result<Self, VerifyError> {
        for jwk in &jwks.keys {
            let kid = jwk.common.key_id.clone();
            let (key, algorithms) = match &jwk.algorithm {
                AlgorithmParameters::RSA(rsa) => (
                    DecodingKey::from_rsa_components(&rsa.n, &rsa.e)?,
                    rsa_algorithms(),
                ),
                AlgorithmParameters::EllipticCurve(ec) => (
                    DecodingKey::from_ec_components(&ec.x, &ec.y)?,
                    ec_algorithms(),
                ),
                AlgorithmParameters::OctetKey(_) | AlgorithmParameters::OctetKeyPair(_) => {
                    debug!(kid = ?kid, "Skipping unsupported JWK key type");
                    continue;
                }
            };
            self.keys.insert(kid, VerificationKey { key, algorithms });
        }
        Ok(self)
    }

    /// Load a JWK set from a JSON file.
    pub fn with_jwks_file(self, path: &Path) -> Result<Self, VerifyError> {
        let raw = fs::read_to_string(path).map_err(|e| key_load_error(path, &e))?;
        let jwks: JwkSet = serde_json::from_str(&raw).map_err(|e| key_load_error(path, &e))?;
        self.with_jwks(&jwks)
    }

    /// Load an RSA or EC public key from a PEM file.
    ///
    /// The file stem is used as the `kid`, so `keys/2024-01.pem` verifies
    /// tokens whose header names `kid: "2024-01"`.
    pub fn with_pem_file(mut self, path: &Path) -> Result<Self, VerifyError> {
        let pem = fs::read(path).map_err(|e| key_load_error(path, &e))?;
        let kid = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned());

        let entry = if let Ok(key) = DecodingKey::from_rsa_pem(&pem) {
            VerificationKey {
                key,
                algorithms: rsa_algorithms(),
            }
        } else {
            let key = DecodingKey::from_ec_pem(&pem).map_err(|e| key_load_error(path, &e))?;
            VerificationKey {
                key,
                algorithms: ec_algorithms(),
            }
        };
        self.keys.insert(kid, entry);
        Ok(self)
    }

    /// Find the key for a token header's `kid`.
    fn select_key(&self, kid: Option<&str>) -> Result<&VerificationKey, VerifyError> {
        if let Some(kid) = kid {
            if let Some(key) = self.keys.get(&Some(kid.to_string())) {
                return Ok(key);
            }
        }
        if let Some(key) = self.keys.get(&None) {
            return Ok(key);
        }
        if self.keys.len() == 1 {
            if let Some(key) = self.keys.values().next() {
                return Ok(key);
            }
        }
        match kid {
            Some(kid) => Err(VerifyError::UnknownKeyId(kid.to_string())),
            None if self.keys.is_empty() => Err(VerifyError::NoKeys),
            None => Err(VerifyError::UnknownKeyId(String::new())),
        }
    }
}

#[async_trait]
impl IdTokenVerifier for JwtVerifier {
    async fn verify(&self, raw: &str) -> Result<ClaimSet, VerifyError> {
        let header = jsonwebtoken::decode_header(raw)?;
        let key = self.select_key(header.kid.as_deref())?;

        if !key.algorithms.contains(&header.alg) {
            warn!(alg = ?header.alg, "Identity token signed with unexpected algorithm");
            return Err(VerifyError::AlgorithmNotAllowed(header.alg));
        }

        let mut validation = Validation::new(header.alg);
        validation.leeway = LEEWAY_SECS;
        validation.validate_nbf = true;
        // Issuer and audience are checked below for clearer errors and to
        // accept both the string and array forms of `aud`.
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp", "iss", "aud"]);

        let token_data = jsonwebtoken::decode::<JsonValue>(raw, &key.key, &validation)?;
        let claims = token_data.claims;

        let issuer = claims.get("iss").and_then(JsonValue::as_str).unwrap_or("");
        if issuer != self.issuer {
            return Err(VerifyError::IssuerMismatch {
                expected: self.issuer.clone(),
                actual: issuer.to_string(),
            });
        }

        check_audience(claims.get("aud").unwrap_or(&JsonValue::Null), &self.audiences)?;

        Ok(ClaimSet::new(claims))
    }
}

fn rsa_algorithms() -> Vec<Algorithm> {
    vec![
        Algorithm::RS256,
        Algorithm::RS384,
        Algorithm::RS512,
        Algorithm::PS256,
        Algorithm::PS384,
        Algorithm::PS512,
    ]
}

fn ec_algorithms() -> Vec<Algorithm> {
    vec![Algorithm::ES256, Algorithm::ES384]
}

fn key_load_error(path: &Path, err: &dyn std::fmt::Display) -> VerifyError {
    VerifyError::KeyLoad {
        source_name: path.display().to_string(),
        reason: err.to_string(),
    }
}

/// Validate that the token's `aud` claim contains one of the expected audiences.
fn check_audience(aud_claim: &JsonValue, expected: &[String]) -> Result<(), VerifyError> {
    let matches = match aud_claim {
        JsonValue::String(s) => expected.iter().any(|e| e == s),
        JsonValue::Array(arr) => arr
            .iter()
            .any(|v| v.as_str().is_some_and(|s| expected.iter().any(|e| e == s))),
        _ => false,
    };

    if matches {
        Ok(())
    } else {
        Err(VerifyError::AudienceMismatch(aud_claim.to_string()))
    }
}
