use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use crashgate_contracts::canonical;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::RwLock;

/// Failures from the backends the gateway fronts. Everything except
/// `NotFound` surfaces as a generic server error; backend failures are
/// never masked as client errors.
#[derive(Debug)]
pub enum AdapterError {
    NotFound,
    Timeout,
    Http(reqwest::Error),
    BadStatus(reqwest::StatusCode),
    InvalidResponse,
    Sqlx(sqlx::Error),
    Io(std::io::Error),
    Internal(String),
}

impl std::fmt::Display for AdapterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdapterError::NotFound => write!(f, "record not found"),
            AdapterError::Timeout => write!(f, "backend request timed out"),
            AdapterError::Http(err) => write!(f, "backend HTTP error: {}", err),
            AdapterError::BadStatus(status) => write!(f, "backend returned status {}", status),
            AdapterError::InvalidResponse => write!(f, "backend returned an invalid response"),
            AdapterError::Sqlx(err) => write!(f, "backend sql error: {}", err),
            AdapterError::Io(err) => write!(f, "backend io error: {}", err),
            AdapterError::Internal(message) => write!(f, "internal adapter error: {}", message),
        }
    }
}

impl std::error::Error for AdapterError {}

impl From<reqwest::Error> for AdapterError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            AdapterError::Timeout
        } else {
            AdapterError::Http(value)
        }
    }
}

impl From<sqlx::Error> for AdapterError {
    fn from(value: sqlx::Error) -> Self {
        AdapterError::Sqlx(value)
    }
}

fn empty_facets() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub hits: Vec<serde_json::Value>,
    #[serde(default = "empty_facets")]
    pub facets: serde_json::Value,
    pub total: u64,
}

/// Full-text search executor. The gateway never interprets the result
/// beyond its envelope; redaction happens downstream.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn search(&self, params: &serde_json::Value) -> Result<SearchResult, AdapterError>;
}

#[derive(Deserialize)]
struct SearchDataResponse {
    result: SearchResult,
}

struct CachedSearch {
    result: SearchResult,
    expires_at: Instant,
}

/// HTTP client for the search service. Responses are cached briefly keyed
/// by the canonical parameter hash; the cache holds pre-redaction data, so
/// the key never needs to include the caller's permissions.
pub struct HttpSearchClient {
    base_url: String,
    http: reqwest::Client,
    cache: RwLock<HashMap<String, CachedSearch>>,
    cache_max_entries: usize,
    cache_ttl: Duration,
}

impl HttpSearchClient {
    pub fn new(
        base_url: String,
        timeout: Duration,
        cache_max_entries: usize,
        cache_ttl: Duration,
    ) -> Result<Self, AdapterError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(AdapterError::Http)?;

        Ok(Self {
            base_url,
            http,
            cache: RwLock::new(HashMap::new()),
            cache_max_entries,
            cache_ttl,
        })
    }

    fn search_url(&self) -> String {
        format!("{}/v1/search", self.base_url.trim_end_matches('/'))
    }

    async fn get_cached(&self, key: &str) -> Option<SearchResult> {
        let now = Instant::now();
        let cache = self.cache.read().await;
        cache
            .get(key)
            .and_then(|entry| (entry.expires_at > now).then(|| entry.result.clone()))
    }

    async fn put_cached(&self, key: String, result: SearchResult) {
        let now = Instant::now();
        let expires_at = now + self.cache_ttl;
        let mut cache = self.cache.write().await;

        cache.retain(|_, entry| entry.expires_at > now);
        cache.insert(key, CachedSearch { result, expires_at });

        if cache.len() <= self.cache_max_entries {
            return;
        }

        let mut overflow = cache.len() - self.cache_max_entries;
        let keys = cache.keys().cloned().collect::<Vec<_>>();
        for k in keys {
            if overflow == 0 {
                break;
            }
            if cache.remove(&k).is_some() {
                overflow -= 1;
            }
        }
    }
}

#[async_trait]
impl SearchBackend for HttpSearchClient {
    async fn search(&self, params: &serde_json::Value) -> Result<SearchResult, AdapterError> {
        let cache_enabled = self.cache_max_entries > 0 && self.cache_ttl > Duration::ZERO;
        let cache_key = canonical::hash_canonical_json(params);

        if cache_enabled {
            if let Some(result) = self.get_cached(&cache_key).await {
                return Ok(result);
            }
        }

        let resp = self
            .http
            .post(self.search_url())
            .json(&serde_json::json!({ "params": params }))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(AdapterError::BadStatus(resp.status()));
        }

        let decoded = resp
            .json::<SearchDataResponse>()
            .await
            .map_err(|_| AdapterError::InvalidResponse)?;

        if cache_enabled {
            self.put_cached(cache_key, decoded.result.clone()).await;
        }

        Ok(decoded.result)
    }
}

/// Canned search backend for tests and local development. Records every
/// payload it is handed so callers can assert on what reached the backend.
pub struct MemorySearch {
    result: SearchResult,
    pub calls: Mutex<Vec<serde_json::Value>>,
}

impl MemorySearch {
    pub fn new(result: SearchResult) -> Self {
        Self {
            result,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_hits(hits: Vec<serde_json::Value>) -> Self {
        let total = hits.len() as u64;
        Self::new(SearchResult {
            hits,
            facets: empty_facets(),
            total,
        })
    }
}

#[async_trait]
impl SearchBackend for MemorySearch {
    async fn search(&self, params: &serde_json::Value) -> Result<SearchResult, AdapterError> {
        let mut calls = match self.calls.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        calls.push(params.clone());
        Ok(self.result.clone())
    }
}

/// Keyed blob reader over the crash store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, AdapterError>;
}

pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> Option<PathBuf> {
        if key.is_empty() || key.starts_with('/') || key.contains('\\') {
            return None;
        }

        let mut path = self.root.clone();
        for component in key.split('/') {
            if component.is_empty() || component == "." || component == ".." {
                return None;
            }
            path.push(component);
        }
        Some(path)
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, AdapterError> {
        let Some(path) = self.resolve(key) else {
            return Ok(None);
        };

        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(AdapterError::Io(err)),
        }
    }
}

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: HashMap<String, Vec<u8>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_object(mut self, key: &str, bytes: Vec<u8>) -> Self {
        self.objects.insert(key.to_string(), bytes);
        self
    }

    pub fn with_json(self, key: &str, value: &serde_json::Value) -> Self {
        let bytes = serde_json::to_vec(value).unwrap_or_default();
        self.with_object(key, bytes)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, AdapterError> {
        Ok(self.objects.get(key).cloned())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BugAssociation {
    pub id: i64,
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignatureFirstDate {
    pub signature: String,
    pub first_date: String,
    pub first_build: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingProcessedCrash {
    pub crash_id: String,
    pub created: String,
    pub is_processed: bool,
}

/// Crash bookkeeping reads: bug associations, signature first-dates, and
/// the missing-processed backlog.
#[async_trait]
pub trait CrashDb: Send + Sync {
    async fn bugs_for_signatures(
        &self,
        signatures: &[String],
    ) -> Result<Vec<BugAssociation>, AdapterError>;

    async fn signatures_for_bugs(
        &self,
        bug_ids: &[i64],
    ) -> Result<Vec<BugAssociation>, AdapterError>;

    async fn first_dates_for_signatures(
        &self,
        signatures: &[String],
    ) -> Result<Vec<SignatureFirstDate>, AdapterError>;

    /// Returns the total backlog size plus one page of it.
    async fn missing_processed_page(
        &self,
        offset: i64,
        limit: i64,
    ) -> Result<(i64, Vec<MissingProcessedCrash>), AdapterError>;
}

#[derive(Clone)]
pub struct PgCrashDb {
    pool: sqlx::PgPool,
    query_timeout: Duration,
}

impl PgCrashDb {
    pub async fn connect(db_url: &str, query_timeout: Duration) -> Result<Self, AdapterError> {
        let pool = tokio::time::timeout(
            Duration::from_secs(2),
            PgPoolOptions::new().max_connections(8).connect(db_url),
        )
        .await
        .map_err(|_| AdapterError::Timeout)??;

        Ok(Self {
            pool,
            query_timeout,
        })
    }

    pub async fn connect_and_migrate(
        db_url: &str,
        query_timeout: Duration,
    ) -> Result<Self, AdapterError> {
        let db = Self::connect(db_url, query_timeout).await?;
        db.migrate().await?;
        Ok(db)
    }

    pub async fn migrate(&self) -> Result<(), AdapterError> {
        let ddl = [
            "CREATE TABLE IF NOT EXISTS crashgate_bug_associations (
                bug_id BIGINT NOT NULL,
                signature TEXT NOT NULL,
                PRIMARY KEY (bug_id, signature)
            )",
            "CREATE TABLE IF NOT EXISTS crashgate_signature_first_dates (
                signature TEXT PRIMARY KEY,
                first_date TIMESTAMPTZ NOT NULL,
                first_build TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS crashgate_missing_processed (
                crash_id TEXT PRIMARY KEY,
                created TIMESTAMPTZ NOT NULL DEFAULT now(),
                is_processed BOOLEAN NOT NULL DEFAULT false
            )",
        ];

        for statement in ddl {
            tokio::time::timeout(Duration::from_secs(10), sqlx::query(statement).execute(&self.pool))
                .await
                .map_err(|_| AdapterError::Timeout)??;
        }
        Ok(())
    }
}

#[async_trait]
impl CrashDb for PgCrashDb {
    async fn bugs_for_signatures(
        &self,
        signatures: &[String],
    ) -> Result<Vec<BugAssociation>, AdapterError> {
        let rows = tokio::time::timeout(
            self.query_timeout,
            sqlx::query(
                "SELECT bug_id, signature FROM crashgate_bug_associations
                 WHERE signature = ANY($1) ORDER BY bug_id",
            )
            .bind(signatures)
            .fetch_all(&self.pool),
        )
        .await
        .map_err(|_| AdapterError::Timeout)??;

        rows.into_iter()
            .map(|row| {
                Ok(BugAssociation {
                    id: row.try_get("bug_id")?,
                    signature: row.try_get("signature")?,
                })
            })
            .collect()
    }

    async fn signatures_for_bugs(
        &self,
        bug_ids: &[i64],
    ) -> Result<Vec<BugAssociation>, AdapterError> {
        let rows = tokio::time::timeout(
            self.query_timeout,
            sqlx::query(
                "SELECT bug_id, signature FROM crashgate_bug_associations
                 WHERE bug_id = ANY($1) ORDER BY bug_id",
            )
            .bind(bug_ids)
            .fetch_all(&self.pool),
        )
        .await
        .map_err(|_| AdapterError::Timeout)??;

        rows.into_iter()
            .map(|row| {
                Ok(BugAssociation {
                    id: row.try_get("bug_id")?,
                    signature: row.try_get("signature")?,
                })
            })
            .collect()
    }

    async fn first_dates_for_signatures(
        &self,
        signatures: &[String],
    ) -> Result<Vec<SignatureFirstDate>, AdapterError> {
        let rows = tokio::time::timeout(
            self.query_timeout,
            sqlx::query(
                "SELECT signature, first_date::text AS first_date, first_build
                 FROM crashgate_signature_first_dates
                 WHERE signature = ANY($1) ORDER BY signature",
            )
            .bind(signatures)
            .fetch_all(&self.pool),
        )
        .await
        .map_err(|_| AdapterError::Timeout)??;

        rows.into_iter()
            .map(|row| {
                Ok(SignatureFirstDate {
                    signature: row.try_get("signature")?,
                    first_date: row.try_get("first_date")?,
                    first_build: row.try_get("first_build")?,
                })
            })
            .collect()
    }

    async fn missing_processed_page(
        &self,
        offset: i64,
        limit: i64,
    ) -> Result<(i64, Vec<MissingProcessedCrash>), AdapterError> {
        let count: i64 = tokio::time::timeout(
            self.query_timeout,
            sqlx::query_scalar("SELECT COUNT(*) FROM crashgate_missing_processed")
                .fetch_one(&self.pool),
        )
        .await
        .map_err(|_| AdapterError::Timeout)??;

        let rows = tokio::time::timeout(
            self.query_timeout,
            sqlx::query(
                "SELECT crash_id, created::text AS created, is_processed
                 FROM crashgate_missing_processed
                 ORDER BY created, crash_id LIMIT $1 OFFSET $2",
            )
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool),
        )
        .await
        .map_err(|_| AdapterError::Timeout)??;

        let records = rows
            .into_iter()
            .map(|row| {
                Ok(MissingProcessedCrash {
                    crash_id: row.try_get("crash_id")?,
                    created: row.try_get("created")?,
                    is_processed: row.try_get("is_processed")?,
                })
            })
            .collect::<Result<Vec<_>, AdapterError>>()?;

        Ok((count, records))
    }
}

#[derive(Default)]
pub struct MemoryCrashDb {
    pub bugs: Vec<BugAssociation>,
    pub first_dates: Vec<SignatureFirstDate>,
    pub missing: Vec<MissingProcessedCrash>,
}

#[async_trait]
impl CrashDb for MemoryCrashDb {
    async fn bugs_for_signatures(
        &self,
        signatures: &[String],
    ) -> Result<Vec<BugAssociation>, AdapterError> {
        Ok(self
            .bugs
            .iter()
            .filter(|bug| signatures.contains(&bug.signature))
            .cloned()
            .collect())
    }

    async fn signatures_for_bugs(
        &self,
        bug_ids: &[i64],
    ) -> Result<Vec<BugAssociation>, AdapterError> {
        Ok(self
            .bugs
            .iter()
            .filter(|bug| bug_ids.contains(&bug.id))
            .cloned()
            .collect())
    }

    async fn first_dates_for_signatures(
        &self,
        signatures: &[String],
    ) -> Result<Vec<SignatureFirstDate>, AdapterError> {
        Ok(self
            .first_dates
            .iter()
            .filter(|record| signatures.contains(&record.signature))
            .cloned()
            .collect())
    }

    async fn missing_processed_page(
        &self,
        offset: i64,
        limit: i64,
    ) -> Result<(i64, Vec<MissingProcessedCrash>), AdapterError> {
        let count = self.missing.len() as i64;
        let page = self
            .missing
            .iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect();
        Ok((count, page))
    }
}

/// Hands accepted crash ids to the reprocessing pipeline. Actual queue
/// delivery is out of scope for the gateway; the production binding logs
/// the handoff and the pipeline tails the log-structured topic.
#[async_trait]
pub trait ReprocessingQueue: Send + Sync {
    async fn publish(&self, crash_ids: &[String]) -> Result<(), AdapterError>;
}

pub struct LogQueue;

#[async_trait]
impl ReprocessingQueue for LogQueue {
    async fn publish(&self, crash_ids: &[String]) -> Result<(), AdapterError> {
        tracing::info!(count = crash_ids.len(), "reprocessing.publish");
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryQueue {
    pub published: Mutex<Vec<Vec<String>>>,
}

#[async_trait]
impl ReprocessingQueue for MemoryQueue {
    async fn publish(&self, crash_ids: &[String]) -> Result<(), AdapterError> {
        let mut published = match self.published.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        published.push(crash_ids.to_vec());
        Ok(())
    }
}
