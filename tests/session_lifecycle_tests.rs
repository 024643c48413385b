//! End-to-end session lifecycle tests
//!
//! Drives a fully configured provider against mock token and userinfo
//! endpoints, with identity tokens signed by a shared HMAC secret:
//! - Code redemption
//! - Refresh of a stale session and failure isolation
//! - Group authorization over realm roles and custom claim paths
//! - Userinfo email lookup

use std::io::Write;

use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use pretty_assertions::assert_eq;
use serde_json::{Value as JsonValue, json};
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use oidc_session::config::{Config, ProviderConfig, VerifierConfig};
use oidc_session::{ErrorKind, OidcProvider, Session, SessionHandle};

const SECRET: &str = "lifecycle-test-secret";
const ISSUER: &str = "https://sso.example.com/realms/main";
const CLIENT_ID: &str = "my-proxy";

fn mint(email: &str, verified: Option<bool>, extra: &JsonValue) -> String {
    let mut claims = json!({
        "iss": ISSUER,
        "aud": CLIENT_ID,
        "sub": "user-1",
        "exp": Utc::now().timestamp() + 300,
        "email": email,
    });
    if let Some(flag) = verified {
        claims["email_verified"] = json!(flag);
    }
    if let (Some(target), Some(fields)) = (claims.as_object_mut(), extra.as_object()) {
        for (k, v) in fields {
            target.insert(k.clone(), v.clone());
        }
    }
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

fn token_response(access: &str, refresh: &str, id_token: &str) -> JsonValue {
    json!({
        "access_token": access,
        "token_type": "Bearer",
        "expires_in": 3600,
        "refresh_token": refresh,
        "id_token": id_token,
    })
}

fn provider_config(server: &MockServer) -> ProviderConfig {
    ProviderConfig {
        client_id: CLIENT_ID.to_string(),
        client_secret: Some("s3cret".to_string()),
        issuer: ISSUER.to_string(),
        token_url: format!("{}/token", server.uri()),
        userinfo_url: Some(format!("{}/userinfo", server.uri())),
        verifier: VerifierConfig {
            hmac_secret: Some(SECRET.to_string()),
            ..VerifierConfig::default()
        },
        ..ProviderConfig::default()
    }
}

fn stale_session(id_token: String) -> Session {
    Session {
        access_token: "AT1".to_string(),
        id_token,
        refresh_token: Some("RT1".to_string()),
        expires_on: Some(Utc::now() - Duration::minutes(5)),
        email: "foo@example.com".to_string(),
    }
}

/// Redeeming a code yields a session built from the verified identity token
#[tokio::test]
async fn test_redeem_authorization_code() {
    // GIVEN: a token endpoint that accepts code abc123
    let server = MockServer::start().await;
    let id_token = mint("foo@example.com", Some(true), &json!({}));
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .and(body_string_contains("code=abc123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_response("AT1", "RT1", &id_token)))
        .expect(1)
        .mount(&server)
        .await;

    let provider = OidcProvider::from_config(&provider_config(&server)).unwrap();

    // WHEN: the code is redeemed
    let before = Utc::now();
    let session = provider
        .redeem("https://proxy.example.com/callback", "abc123")
        .await
        .unwrap();

    // THEN: every field comes from the token response
    assert_eq!(session.email, "foo@example.com");
    assert_eq!(session.access_token, "AT1");
    assert_eq!(session.refresh_token.as_deref(), Some("RT1"));
    assert_eq!(session.id_token, id_token);
    let expires_on = session.expires_on.unwrap();
    assert!(expires_on >= before + Duration::seconds(3600));
    assert!(expires_on <= Utc::now() + Duration::seconds(3600));
}

/// An identity token signed with another key never becomes a session
#[tokio::test]
async fn test_redeem_rejects_forged_identity_token() {
    let server = MockServer::start().await;
    let forged = jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &json!({"iss": ISSUER, "aud": CLIENT_ID, "exp": Utc::now().timestamp() + 300, "email": "mallory@example.com"}),
        &EncodingKey::from_secret(b"not-the-secret"),
    )
    .unwrap();
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_response("AT1", "RT1", &forged)))
        .mount(&server)
        .await;

    let provider = OidcProvider::from_config(&provider_config(&server)).unwrap();
    let err = provider.redeem("https://cb", "abc123").await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Verification);
    assert!(err.to_string().starts_with("unable to update session: could not verify identity token"));
}

/// Refresh of an expired session replaces every field with the new tokens
#[tokio::test]
async fn test_refresh_replaces_stale_session() {
    // GIVEN: an expired session and a token endpoint that accepts RT1
    let server = MockServer::start().await;
    let new_id_token = mint("foo.new@example.com", Some(true), &json!({}));
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=RT1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_response("AT2", "RT2", &new_id_token)))
        .expect(1)
        .mount(&server)
        .await;

    let provider = OidcProvider::from_config(&provider_config(&server)).unwrap();
    let mut session = stale_session(mint("foo@example.com", Some(true), &json!({})));

    // WHEN: refreshed
    let refreshed = provider.refresh_if_needed(&mut session).await.unwrap();

    // THEN: the whole session is replaced
    assert!(refreshed);
    assert_eq!(session.access_token, "AT2");
    assert_eq!(session.refresh_token.as_deref(), Some("RT2"));
    assert_eq!(session.id_token, new_id_token);
    assert_eq!(session.email, "foo.new@example.com");
    assert!(session.expires_on.unwrap() > Utc::now());

    // AND: a second call is a no-op (the mock expects exactly one grant)
    assert!(!provider.refresh_if_needed(&mut session).await.unwrap());
}

/// A refresh response without a new refresh token keeps the old one
#[tokio::test]
async fn test_refresh_without_new_refresh_token_stays_refreshable() {
    // GIVEN: a token endpoint that renews the access token only
    let server = MockServer::start().await;
    let new_id_token = mint("foo@example.com", Some(true), &json!({}));
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("refresh_token=RT1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "AT2",
            "expires_in": 3600,
            "id_token": new_id_token,
        })))
        .expect(1)
        .mount(&server)
        .await;

    let provider = OidcProvider::from_config(&provider_config(&server)).unwrap();
    let mut session = stale_session(mint("foo@example.com", Some(true), &json!({})));

    // WHEN: refreshed
    assert!(provider.refresh_if_needed(&mut session).await.unwrap());

    // THEN: the session can still be refreshed later
    assert_eq!(session.access_token, "AT2");
    assert_eq!(session.refresh_token.as_deref(), Some("RT1"));
    assert!(session.can_refresh());
}

/// A quoted `expires_in` is accepted during code redemption
#[tokio::test]
async fn test_redeem_accepts_quoted_expires_in() {
    let server = MockServer::start().await;
    let id_token = mint("foo@example.com", Some(true), &json!({}));
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "AT1",
            "expires_in": "3600",
            "refresh_token": "RT1",
            "id_token": id_token,
        })))
        .mount(&server)
        .await;

    let provider = OidcProvider::from_config(&provider_config(&server)).unwrap();
    let session = provider.redeem("https://cb", "abc123").await.unwrap();

    assert!(session.expires_on.unwrap() > Utc::now() + Duration::seconds(3500));
}

/// A rejected refresh grant leaves the session exactly as it was
#[tokio::test]
async fn test_refresh_failure_keeps_session() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_string(r#"{"error":"invalid_grant"}"#))
        .mount(&server)
        .await;

    let provider = OidcProvider::from_config(&provider_config(&server)).unwrap();
    let mut session = stale_session(mint("foo@example.com", Some(true), &json!({})));
    let before = session.clone();

    let err = provider.refresh_if_needed(&mut session).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Exchange);
    assert!(err.to_string().starts_with("unable to redeem refresh token: "));
    assert_eq!(session, before);
}

/// A refreshed token with an unverified email is rejected without side effects
#[tokio::test]
async fn test_refresh_with_unverified_email_keeps_session() {
    let server = MockServer::start().await;
    let id_token = mint("foo@example.com", Some(false), &json!({}));
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_response("AT2", "RT2", &id_token)))
        .mount(&server)
        .await;

    let provider = OidcProvider::from_config(&provider_config(&server)).unwrap();
    let mut session = stale_session(mint("foo@example.com", Some(true), &json!({})));
    let before = session.clone();

    let err = provider.refresh_if_needed(&mut session).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Projection);
    assert_eq!(
        err.to_string(),
        "unable to update session: email in identity token (foo@example.com) isn't verified"
    );
    assert_eq!(session, before);
}

/// Two refreshers racing on one shared session: exactly one commit lands
#[tokio::test]
async fn test_shared_refresh_detects_concurrent_commit() {
    let server = MockServer::start().await;
    let id_token = mint("foo@example.com", Some(true), &json!({}));
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_response("AT2", "RT2", &id_token)))
        .mount(&server)
        .await;

    let provider = OidcProvider::from_config(&provider_config(&server)).unwrap();
    let handle = SessionHandle::new(stale_session(mint("foo@example.com", Some(true), &json!({}))));

    // GIVEN: another writer commits after our snapshot would have been taken
    let other = handle.snapshot();
    let mut replacement = other.session.clone();
    replacement.access_token = "AT-other".to_string();
    replacement.expires_on = None;

    assert!(provider.refresh_shared(&handle).await.unwrap());
    let err = handle.commit(other.version, replacement).unwrap_err();

    // THEN: the late writer loses and the refreshed session stays
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(handle.snapshot().session.access_token, "AT2");
}

/// Realm roles gate access when allowed_groups is configured
#[tokio::test]
async fn test_authorize_by_realm_roles() {
    let server = MockServer::start().await;
    let mut config = provider_config(&server);
    config.allowed_groups = vec!["admin".to_string(), "ops".to_string()];
    let provider = OidcProvider::from_config(&config).unwrap();

    let allowed = stale_session(mint(
        "foo@example.com",
        Some(true),
        &json!({"realm_access": {"roles": ["dev", "ops"]}}),
    ));
    let denied = stale_session(mint(
        "foo@example.com",
        Some(true),
        &json!({"realm_access": {"roles": ["dev"]}}),
    ));

    assert!(provider.authorize(&allowed).await);
    assert!(!provider.authorize(&denied).await);
}

/// A custom role claim path is honored
#[tokio::test]
async fn test_authorize_by_custom_claim_path() {
    let server = MockServer::start().await;
    let mut config = provider_config(&server);
    config.allowed_groups = vec!["engineering".to_string()];
    config.role_claim = "groups".to_string();
    let provider = OidcProvider::from_config(&config).unwrap();

    let session = stale_session(mint(
        "foo@example.com",
        Some(true),
        &json!({"groups": ["sales", "engineering"]}),
    ));

    assert!(provider.authorize(&session).await);
}

/// Without allowed_groups every session is authorized
#[tokio::test]
async fn test_authorize_without_policy() {
    let server = MockServer::start().await;
    let provider = OidcProvider::from_config(&provider_config(&server)).unwrap();
    let mut session = stale_session("not-a-jwt".to_string());
    session.email = "anyone@example.com".to_string();

    assert!(provider.authorize(&session).await);
    assert!(!provider.validate_session(&session).await);
}

/// Userinfo lookup uses the session's access token
#[tokio::test]
async fn test_fetch_email_from_userinfo() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/userinfo"))
        .and(header("authorization", "Bearer AT1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"email": "foo@example.com"})))
        .expect(1)
        .mount(&server)
        .await;

    let provider = OidcProvider::from_config(&provider_config(&server)).unwrap();
    let session = stale_session(mint("foo@example.com", Some(true), &json!({})));

    assert_eq!(provider.fetch_email(&session).await.unwrap(), "foo@example.com");
}

/// A YAML file on disk configures a working provider
#[tokio::test]
async fn test_provider_from_yaml_file() {
    let server = MockServer::start().await;
    let id_token = mint("foo@example.com", None, &json!({}));
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_response("AT1", "RT1", &id_token)))
        .mount(&server)
        .await;

    let yaml = format!(
        r#"
provider:
  provider_name: Keycloak
  client_id: {CLIENT_ID}
  issuer: {ISSUER}
  token_url: {uri}/token
  http_timeout: 5s
  verifier:
    hmac_secret: {SECRET}
"#,
        uri = server.uri()
    );
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(yaml.as_bytes()).unwrap();

    let config = Config::load(Some(file.path())).unwrap();
    let provider = OidcProvider::from_config(&config.provider).unwrap();

    assert_eq!(provider.name(), "Keycloak");
    let session = provider.redeem("https://cb", "abc123").await.unwrap();
    assert_eq!(session.email, "foo@example.com");
}

/// Incomplete configuration is rejected up front
#[test]
fn test_provider_requires_key_source() {
    let config = ProviderConfig {
        client_id: CLIENT_ID.to_string(),
        issuer: ISSUER.to_string(),
        token_url: "https://sso.example.com/token".to_string(),
        ..ProviderConfig::default()
    };

    let err = OidcProvider::from_config(&config).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Config);
}
