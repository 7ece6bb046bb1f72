use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use crashgate_auth::{
    AUTH_TOKEN_HEADER, MemoryTokenStore, PermissionResolver, SessionConfig, SessionVerifier,
    TokenStore, TokenStoreError, unix_epoch_ms_now,
};
use crashgate_contracts::{AuthState, Permission, PermissionSet};
use http::HeaderMap;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde::Serialize;

const SESSION_SECRET: &str = "test-session-secret";
const SESSION_ISSUER: &str = "crashgate-tests";

fn source_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(12, 12, 12, 12))
}

fn session_verifier() -> SessionVerifier {
    SessionVerifier::new(&SessionConfig {
        secret: SESSION_SECRET.to_string(),
        issuer: SESSION_ISSUER.to_string(),
        clock_skew: Duration::from_secs(60),
    })
}

#[derive(Serialize)]
struct Claims {
    sub: String,
    iss: String,
    exp: i64,
    permissions: Vec<String>,
}

fn session_bearer(sub: &str, permissions: &[Permission]) -> String {
    let claims = Claims {
        sub: sub.to_string(),
        iss: SESSION_ISSUER.to_string(),
        exp: unix_epoch_ms_now() / 1000 + 600,
        permissions: permissions
            .iter()
            .map(|p| p.codename().to_string())
            .collect(),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(SESSION_SECRET.as_bytes()),
    )
    .expect("session token should encode")
}

async fn store_with_token(key: &str, permissions: &[Permission]) -> Arc<MemoryTokenStore> {
    let store = Arc::new(MemoryTokenStore::new());
    let grant = PermissionSet::of(permissions);
    store
        .create(key, "owner@example.com", &grant, &grant, None)
        .await
        .expect("token creation should succeed");
    store
}

#[tokio::test]
async fn valid_token_header_resolves_to_token_context() {
    let store = store_with_token("sekrit", &[Permission::ViewPii]).await;
    let resolver = PermissionResolver::new(store, Some(session_verifier()));

    let mut headers = HeaderMap::new();
    headers.insert(AUTH_TOKEN_HEADER, "sekrit".parse().unwrap());

    let caller = resolver.resolve(&headers, source_ip()).await.unwrap();
    assert_eq!(
        caller.auth,
        AuthState::Token {
            owner: "owner@example.com".to_string()
        }
    );
    assert!(caller.permissions.contains(Permission::ViewPii));
    assert!(!caller.permissions.contains(Permission::ViewRawDump));
}

#[tokio::test]
async fn unknown_token_resolves_to_anonymous_not_an_error() {
    let store = store_with_token("sekrit", &[Permission::ViewPii]).await;
    let resolver = PermissionResolver::new(store, Some(session_verifier()));

    let mut headers = HeaderMap::new();
    headers.insert(AUTH_TOKEN_HEADER, "somecrap".parse().unwrap());

    let caller = resolver.resolve(&headers, source_ip()).await.unwrap();
    assert_eq!(caller.auth, AuthState::Anonymous);
    assert!(caller.permissions.is_empty());
}

#[tokio::test]
async fn token_header_shadows_session_credentials() {
    // A bad token plus a good session still means anonymous: token presence
    // decides the outcome on its own.
    let store = store_with_token("sekrit", &[Permission::ViewPii]).await;
    let resolver = PermissionResolver::new(store, Some(session_verifier()));

    let mut headers = HeaderMap::new();
    headers.insert(AUTH_TOKEN_HEADER, "expired-or-bogus".parse().unwrap());
    let bearer = session_bearer("jo@example.com", &[Permission::ViewPii]);
    headers.insert(
        http::header::AUTHORIZATION,
        format!("Bearer {}", bearer).parse().unwrap(),
    );

    let caller = resolver.resolve(&headers, source_ip()).await.unwrap();
    assert_eq!(caller.auth, AuthState::Anonymous);
}

#[tokio::test]
async fn expired_token_resolves_to_anonymous() {
    let store = Arc::new(MemoryTokenStore::new());
    let grant = PermissionSet::of(&[Permission::ViewPii]);
    store
        .create(
            "old",
            "owner@example.com",
            &grant,
            &grant,
            Some(unix_epoch_ms_now() - 1_000),
        )
        .await
        .unwrap();
    let resolver = PermissionResolver::new(store, None);

    let mut headers = HeaderMap::new();
    headers.insert(AUTH_TOKEN_HEADER, "old".parse().unwrap());

    let caller = resolver.resolve(&headers, source_ip()).await.unwrap();
    assert_eq!(caller.auth, AuthState::Anonymous);
}

#[tokio::test]
async fn session_bearer_resolves_to_session_context() {
    let store = Arc::new(MemoryTokenStore::new());
    let resolver = PermissionResolver::new(store, Some(session_verifier()));

    let bearer = session_bearer("jo@example.com", &[Permission::ReprocessCrashes]);
    let mut headers = HeaderMap::new();
    headers.insert(
        http::header::AUTHORIZATION,
        format!("Bearer {}", bearer).parse().unwrap(),
    );

    let caller = resolver.resolve(&headers, source_ip()).await.unwrap();
    assert_eq!(
        caller.auth,
        AuthState::Session {
            user: "jo@example.com".to_string()
        }
    );
    assert!(caller.permissions.contains(Permission::ReprocessCrashes));
}

#[tokio::test]
async fn tampered_session_bearer_resolves_to_anonymous() {
    let store = Arc::new(MemoryTokenStore::new());
    let resolver = PermissionResolver::new(store, Some(session_verifier()));

    let claims = Claims {
        sub: "jo@example.com".to_string(),
        iss: SESSION_ISSUER.to_string(),
        exp: unix_epoch_ms_now() / 1000 + 600,
        permissions: vec!["view_pii".to_string()],
    };
    let forged = encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(b"wrong-secret"),
    )
    .unwrap();

    let mut headers = HeaderMap::new();
    headers.insert(
        http::header::AUTHORIZATION,
        format!("Bearer {}", forged).parse().unwrap(),
    );

    let caller = resolver.resolve(&headers, source_ip()).await.unwrap();
    assert_eq!(caller.auth, AuthState::Anonymous);
}

#[tokio::test]
async fn no_credentials_resolves_to_anonymous() {
    let store = Arc::new(MemoryTokenStore::new());
    let resolver = PermissionResolver::new(store, None);

    let caller = resolver
        .resolve(&HeaderMap::new(), source_ip())
        .await
        .unwrap();
    assert_eq!(caller.auth, AuthState::Anonymous);
    assert_eq!(caller.source_ip, source_ip());
}

#[tokio::test]
async fn token_creation_rejects_grants_beyond_the_owner() {
    let store = MemoryTokenStore::new();
    let owner_permissions = PermissionSet::of(&[Permission::ReprocessCrashes]);
    let grant = PermissionSet::of(&[Permission::ReprocessCrashes, Permission::ViewPii]);

    let err = store
        .create("t", "owner@example.com", &owner_permissions, &grant, None)
        .await
        .unwrap_err();
    match err {
        TokenStoreError::PermissionExceedsOwner(p) => assert_eq!(p, Permission::ViewPii),
        other => panic!("expected PermissionExceedsOwner, got {}", other),
    }

    // Nothing was stored.
    assert!(store.lookup("t").await.unwrap().is_none());
}
