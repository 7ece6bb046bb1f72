use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use crashgate_contracts::canonical;
use crashgate_contracts::{AuthState, CallerContext, Permission, PermissionSet};
use http::HeaderMap;
use http::header;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::Deserialize;
use sqlx::Row;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::RwLock;

/// Header carrying an API token key. Kept distinct from `Authorization`,
/// which carries session bearer tokens.
pub const AUTH_TOKEN_HEADER: &str = "auth-token";

pub fn unix_epoch_ms_now() -> i64 {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    duration.as_millis().min(i64::MAX as u128) as i64
}

/// One stored API token. `permissions` is the exact set attached to the
/// token, constrained to a subset of the owner's permissions when the token
/// was created; resolution never re-checks ownership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiToken {
    pub owner: String,
    pub permissions: PermissionSet,
    pub expires_at_epoch_ms: Option<i64>,
}

impl ApiToken {
    fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_epoch_ms
            .is_some_and(|expires| now_ms > expires)
    }
}

#[derive(Debug)]
pub enum TokenStoreError {
    Timeout,
    Sqlx(sqlx::Error),
    PermissionExceedsOwner(Permission),
}

impl std::fmt::Display for TokenStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenStoreError::Timeout => write!(f, "token store operation timed out"),
            TokenStoreError::Sqlx(err) => write!(f, "token store sql error: {}", err),
            TokenStoreError::PermissionExceedsOwner(permission) => write!(
                f,
                "token permission `{}` exceeds the owner's permissions",
                permission.codename()
            ),
        }
    }
}

impl std::error::Error for TokenStoreError {}

impl From<sqlx::Error> for TokenStoreError {
    fn from(value: sqlx::Error) -> Self {
        TokenStoreError::Sqlx(value)
    }
}

/// Read/create access to API tokens. Lookups are by plaintext key; stores
/// only ever hold the key's sha256.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Unknown and expired keys both resolve to `None`; denial happens at
    /// the gateway's permission check, not here.
    async fn lookup(&self, key: &str) -> Result<Option<ApiToken>, TokenStoreError>;

    /// Create a token for `owner`. `grant` must be a subset of
    /// `owner_permissions` or the store refuses the token.
    async fn create(
        &self,
        key: &str,
        owner: &str,
        owner_permissions: &PermissionSet,
        grant: &PermissionSet,
        expires_at_epoch_ms: Option<i64>,
    ) -> Result<(), TokenStoreError>;
}

fn key_hash(key: &str) -> String {
    canonical::sha256_hex(key.trim().as_bytes())
}

fn check_grant(
    owner_permissions: &PermissionSet,
    grant: &PermissionSet,
) -> Result<(), TokenStoreError> {
    match owner_permissions.first_missing(grant) {
        None => Ok(()),
        Some(permission) => Err(TokenStoreError::PermissionExceedsOwner(permission)),
    }
}

#[derive(Default)]
pub struct MemoryTokenStore {
    tokens: RwLock<HashMap<String, ApiToken>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn lookup(&self, key: &str) -> Result<Option<ApiToken>, TokenStoreError> {
        let tokens = self.tokens.read().await;
        Ok(tokens
            .get(&key_hash(key))
            .filter(|token| !token.is_expired(unix_epoch_ms_now()))
            .cloned())
    }

    async fn create(
        &self,
        key: &str,
        owner: &str,
        owner_permissions: &PermissionSet,
        grant: &PermissionSet,
        expires_at_epoch_ms: Option<i64>,
    ) -> Result<(), TokenStoreError> {
        check_grant(owner_permissions, grant)?;
        let mut tokens = self.tokens.write().await;
        tokens.insert(
            key_hash(key),
            ApiToken {
                owner: owner.to_string(),
                permissions: grant.clone(),
                expires_at_epoch_ms,
            },
        );
        Ok(())
    }
}

#[derive(Clone)]
pub struct PgTokenStore {
    pool: sqlx::PgPool,
    query_timeout: Duration,
}

impl PgTokenStore {
    pub async fn connect(db_url: &str, query_timeout: Duration) -> Result<Self, TokenStoreError> {
        let pool = tokio::time::timeout(
            Duration::from_secs(2),
            PgPoolOptions::new().max_connections(8).connect(db_url),
        )
        .await
        .map_err(|_| TokenStoreError::Timeout)??;

        Ok(Self {
            pool,
            query_timeout,
        })
    }

    pub async fn connect_and_migrate(
        db_url: &str,
        query_timeout: Duration,
    ) -> Result<Self, TokenStoreError> {
        let store = Self::connect(db_url, query_timeout).await?;
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), TokenStoreError> {
        tokio::time::timeout(
            Duration::from_secs(10),
            sqlx::query(
                "CREATE TABLE IF NOT EXISTS crashgate_tokens (
                    key_hash TEXT PRIMARY KEY,
                    owner TEXT NOT NULL,
                    permissions TEXT[] NOT NULL,
                    expires_at_epoch_ms BIGINT
                )",
            )
            .execute(&self.pool),
        )
        .await
        .map_err(|_| TokenStoreError::Timeout)??;
        Ok(())
    }
}

#[async_trait]
impl TokenStore for PgTokenStore {
    async fn lookup(&self, key: &str) -> Result<Option<ApiToken>, TokenStoreError> {
        let row = tokio::time::timeout(
            self.query_timeout,
            sqlx::query(
                "SELECT owner, permissions, expires_at_epoch_ms
                 FROM crashgate_tokens WHERE key_hash = $1",
            )
            .bind(key_hash(key))
            .fetch_optional(&self.pool),
        )
        .await
        .map_err(|_| TokenStoreError::Timeout)??;

        let Some(row) = row else {
            return Ok(None);
        };

        let codenames: Vec<String> = row.try_get("permissions")?;
        let token = ApiToken {
            owner: row.try_get("owner")?,
            permissions: PermissionSet::from_codenames(codenames.iter().map(|s| s.as_str())),
            expires_at_epoch_ms: row.try_get("expires_at_epoch_ms")?,
        };

        if token.is_expired(unix_epoch_ms_now()) {
            return Ok(None);
        }
        Ok(Some(token))
    }

    async fn create(
        &self,
        key: &str,
        owner: &str,
        owner_permissions: &PermissionSet,
        grant: &PermissionSet,
        expires_at_epoch_ms: Option<i64>,
    ) -> Result<(), TokenStoreError> {
        check_grant(owner_permissions, grant)?;

        tokio::time::timeout(
            self.query_timeout,
            sqlx::query(
                "INSERT INTO crashgate_tokens (key_hash, owner, permissions, expires_at_epoch_ms)
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(key_hash(key))
            .bind(owner)
            .bind(grant.codenames())
            .bind(expires_at_epoch_ms)
            .execute(&self.pool),
        )
        .await
        .map_err(|_| TokenStoreError::Timeout)??;

        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub secret: String,
    pub issuer: String,
    pub clock_skew: Duration,
}

/// Verifies HS256 session bearer tokens minted by the login frontend.
/// Verification failures yield an anonymous caller, never an error.
#[derive(Clone)]
pub struct SessionVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

#[derive(Debug, Deserialize)]
struct SessionClaims {
    sub: String,
    #[serde(default)]
    permissions: Vec<String>,
}

impl SessionVerifier {
    pub fn new(config: &SessionConfig) -> Self {
        let decoding_key = DecodingKey::from_secret(config.secret.as_bytes());
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(std::slice::from_ref(&config.issuer));
        validation.leeway = config.clock_skew.as_secs();
        Self {
            decoding_key,
            validation,
        }
    }

    pub fn verify(&self, token: &str) -> Option<(String, PermissionSet)> {
        let decoded = decode::<SessionClaims>(token, &self.decoding_key, &self.validation).ok()?;
        let claims = decoded.claims;
        let permissions =
            PermissionSet::from_codenames(claims.permissions.iter().map(|s| s.as_str()));
        Some((claims.sub, permissions))
    }
}

/// Resolves one request's headers into a `CallerContext`.
///
/// Resolution order: an `Auth-Token` header, when present, decides the
/// outcome by itself (a bad key means anonymous, with no session fallback);
/// otherwise a session bearer token is tried; otherwise the caller is
/// anonymous. Resolution is read-only.
#[derive(Clone)]
pub struct PermissionResolver {
    tokens: Arc<dyn TokenStore>,
    sessions: Option<SessionVerifier>,
}

impl PermissionResolver {
    pub fn new(tokens: Arc<dyn TokenStore>, sessions: Option<SessionVerifier>) -> Self {
        Self { tokens, sessions }
    }

    pub async fn resolve(
        &self,
        headers: &HeaderMap,
        source_ip: IpAddr,
    ) -> Result<CallerContext, TokenStoreError> {
        if let Some(key) = header_value(headers, AUTH_TOKEN_HEADER) {
            return Ok(match self.tokens.lookup(key).await? {
                Some(token) => CallerContext {
                    auth: AuthState::Token { owner: token.owner },
                    permissions: token.permissions,
                    source_ip,
                },
                None => CallerContext::anonymous(source_ip),
            });
        }

        if let Some(verifier) = self.sessions.as_ref() {
            if let Some(bearer) = bearer_token(headers) {
                if let Some((user, permissions)) = verifier.verify(&bearer) {
                    return Ok(CallerContext {
                        auth: AuthState::Session { user },
                        permissions,
                        source_ip,
                    });
                }
            }
        }

        Ok(CallerContext::anonymous(source_ip))
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let authz = header_value(headers, header::AUTHORIZATION.as_str())?;
    let token = authz
        .strip_prefix("Bearer ")
        .or_else(|| authz.strip_prefix("bearer "))?
        .trim();

    (!token.is_empty()).then(|| token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_token_requires_the_bearer_scheme() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, "Basic dXNlcg==".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, "Bearer   ".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, "Bearer abc.def.ghi".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc.def.ghi".to_string()));
    }

    #[test]
    fn expired_tokens_are_expired() {
        let token = ApiToken {
            owner: "jo".to_string(),
            permissions: PermissionSet::new(),
            expires_at_epoch_ms: Some(1_000),
        };
        assert!(token.is_expired(2_000));
        assert!(!token.is_expired(500));

        let forever = ApiToken {
            owner: "jo".to_string(),
            permissions: PermissionSet::new(),
            expires_at_epoch_ms: None,
        };
        assert!(!forever.is_expired(i64::MAX - 1));
    }

    #[test]
    fn grant_check_names_the_offending_permission() {
        let owner = PermissionSet::of(&[Permission::ViewPii]);
        let grant = PermissionSet::of(&[Permission::ViewPii, Permission::ReprocessCrashes]);
        match check_grant(&owner, &grant) {
            Err(TokenStoreError::PermissionExceedsOwner(p)) => {
                assert_eq!(p, Permission::ReprocessCrashes);
            }
            other => panic!("expected PermissionExceedsOwner, got {:?}", other.err()),
        }
    }
}
