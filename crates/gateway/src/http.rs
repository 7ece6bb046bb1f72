use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use crashgate_auth::{
    PermissionResolver, PgTokenStore, SessionConfig, SessionVerifier, TokenStore,
};
use crashgate_contracts::{ApiError, CallerContext, InvocationResult, UNKNOWN_SOURCE_IP};
use serde_json::json;
use tracing::Instrument;
use ulid::Ulid;

use crate::adapters::{AdapterError, FsObjectStore, HttpSearchClient, LogQueue, PgCrashDb};
use crate::config::{GatewayConfig, StartupError};
use crate::models::{Backends, PAGE_SIZE, build_registry, scrub_protected_params};
use crate::params::{ValidatedParams, validate};
use crate::rate_limit::{RateLimiter, RateQuota};
use crate::registry::{ModelEntry, ModelMethod, ModelRegistry};

#[derive(Clone)]
pub struct AppState {
    config: GatewayConfig,
    registry: Arc<ModelRegistry>,
    resolver: PermissionResolver,
    rate_limiter: RateLimiter,
}

/// Production router: backends built from config (HTTP search service,
/// filesystem crash store, Postgres crash db + token store).
pub async fn router(config: GatewayConfig) -> Result<Router, StartupError> {
    let search_url = config.search_url.clone().ok_or_else(|| StartupError {
        code: "ERR_MISSING_CONFIG",
        message: "missing required config key CRASHGATE_SEARCH_URL".to_string(),
    })?;

    let search = HttpSearchClient::new(
        search_url,
        Duration::from_millis(config.search_timeout_ms),
        config.search_cache_max_entries,
        Duration::from_millis(config.search_cache_ttl_ms),
    )
    .map_err(|_| StartupError {
        code: "ERR_SEARCH_UNAVAILABLE",
        message: "failed to initialize search client".to_string(),
    })?;

    let db_url = config.db_url.clone().ok_or_else(|| StartupError {
        code: "ERR_MISSING_CONFIG",
        message: "missing required config key CRASHGATE_DB_URL".to_string(),
    })?;
    let query_timeout = Duration::from_millis(config.db_query_timeout_ms);

    let crash_db = PgCrashDb::connect_and_migrate(&db_url, query_timeout)
        .await
        .map_err(|err| StartupError {
            code: "ERR_DB_UNAVAILABLE",
            message: format!("failed to initialize crash db: {}", err),
        })?;

    let tokens = PgTokenStore::connect_and_migrate(&db_url, query_timeout)
        .await
        .map_err(|err| StartupError {
            code: "ERR_DB_UNAVAILABLE",
            message: format!("failed to initialize token store: {}", err),
        })?;

    let backends = Backends {
        search: Arc::new(search),
        objects: Arc::new(FsObjectStore::new(config.crash_store_path.clone())),
        crash_db: Arc::new(crash_db),
        queue: Arc::new(LogQueue),
    };

    Ok(router_with_backends(config, backends, Arc::new(tokens)))
}

/// Router over explicit backends; tests and local profiles inject memory
/// implementations here.
pub fn router_with_backends(
    config: GatewayConfig,
    backends: Backends,
    tokens: Arc<dyn TokenStore>,
) -> Router {
    let sessions = config.session_secret.as_ref().map(|secret| {
        SessionVerifier::new(&SessionConfig {
            secret: secret.clone(),
            issuer: config.session_issuer.clone(),
            clock_skew: Duration::from_secs(config.session_clock_skew_secs),
        })
    });

    let state = AppState {
        registry: Arc::new(build_registry(&backends)),
        resolver: PermissionResolver::new(tokens, sessions),
        rate_limiter: RateLimiter::new(16_384),
        config,
    };

    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route(
            "/api/{model}/",
            get(model_wrapper_get)
                .post(model_wrapper_post)
                .options(model_options),
        )
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics() -> Response {
    match crate::metrics::render() {
        Ok((body, content_type)) => {
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(content_type.as_str()) {
                headers.insert(header::CONTENT_TYPE, value);
            }
            (headers, body).into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn model_options() -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Auth-Token, Content-Type"),
    );
    (StatusCode::OK, headers).into_response()
}

async fn model_wrapper_get(
    State(state): State<AppState>,
    Path(model_name): Path<String>,
    Query(query): Query<Vec<(String, String)>>,
    headers: HeaderMap,
) -> Response {
    handle_model(state, Method::GET, model_name, headers, query, Bytes::new()).await
}

async fn model_wrapper_post(
    State(state): State<AppState>,
    Path(model_name): Path<String>,
    Query(query): Query<Vec<(String, String)>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_model(state, Method::POST, model_name, headers, query, body).await
}

async fn handle_model(
    state: AppState,
    method: Method,
    model_name: String,
    headers: HeaderMap,
    query: Vec<(String, String)>,
    body: Bytes,
) -> Response {
    let started = Instant::now();
    let request_id = extract_request_id(&headers);
    let normalized_path = format!("/api/{}/", model_name.to_lowercase());
    let method_label = method.to_string();
    let ajax = is_ajax(&headers);

    let span = tracing::info_span!(
        "api.model_wrapper",
        request_id = %request_id,
        model = %model_name,
        caller = tracing::field::Empty,
        outcome = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
    );

    let (response, model_known) = async {
        let source_ip = extract_source_ip(&headers);
        let caller = match state.resolver.resolve(&headers, source_ip).await {
            Ok(caller) => caller,
            Err(err) => {
                tracing::error!(error = %err, "auth.token_store_unavailable");
                return (error_response(&ApiError::Backend(err.to_string())), false);
            }
        };
        tracing::Span::current().record("caller", caller.owner().unwrap_or("anonymous"));

        // Reject-early: quota exhaustion short-circuits before any gateway
        // work or backend side effects.
        let (bucket, quota) = rate_bucket(&state.config, &caller);
        if !state.rate_limiter.allow(&bucket, quota) {
            crate::metrics::inc_rate_limited();
            return (error_response(&ApiError::RateLimited), true);
        }

        let entry = match state.registry.describe(&model_name) {
            Ok(entry) => entry,
            Err(err) => return (error_response(&err), false),
        };

        match run_model(entry, &caller, &method, &headers, query, &body, &model_name).await {
            Ok(response) => (response, true),
            Err(err) => {
                if let ApiError::Backend(message) = &err {
                    tracing::error!(error = %message, model = %model_name, "adapter.failed");
                }
                (error_response(&err), true)
            }
        }
    }
    .instrument(span.clone())
    .await;

    let status = response.status();
    span.record(
        "outcome",
        if status.is_success() { "ok" } else { "error" },
    );
    span.record("latency_ms", started.elapsed().as_millis() as u64);

    if model_known {
        crate::metrics::observe_pageview(ajax, true, &normalized_path, status.as_u16());
    }
    crate::metrics::observe_http_request(
        "/api/{model}/",
        &method_label,
        status.as_u16(),
        started.elapsed(),
    );

    response
}

#[allow(clippy::too_many_arguments)]
async fn run_model(
    entry: &ModelEntry,
    caller: &CallerContext,
    method: &Method,
    headers: &HeaderMap,
    query: Vec<(String, String)>,
    body: &Bytes,
    model_name: &str,
) -> Result<Response, ApiError> {
    let descriptor = &entry.descriptor;

    let expected = match descriptor.method {
        ModelMethod::Read => Method::GET,
        ModelMethod::Write => Method::POST,
    };
    if *method != expected {
        return Err(ApiError::MethodNotAllowed);
    }

    let mut raw_params = query;
    if *method == Method::POST {
        raw_params.extend(body_pairs(headers, body)?);
    }

    let mut params = validate(&descriptor.params, &raw_params).map_err(ApiError::BadRequest)?;

    let page = if descriptor.paginate {
        Some(validate_page(&params)?)
    } else {
        None
    };

    descriptor.check_permissions(caller, &params)?;

    if descriptor.scrub_protected_params {
        scrub_protected_params(&descriptor.field_policy, &caller.permissions, &mut params);
    }

    let result = entry.adapter.invoke(&params).await.map_err(|err| match err {
        AdapterError::NotFound => ApiError::NotFound,
        other => ApiError::Backend(other.to_string()),
    })?;

    let mut response = match result {
        InvocationResult::Binary { bytes, filename } => binary_response(bytes, &filename),
        InvocationResult::Json(value) => {
            let redacted =
                crashgate_policy::redact(&descriptor.field_policy, &caller.permissions, &value);
            let body = match page {
                Some(page) => paginate_envelope(headers, model_name, page, redacted),
                None => redacted,
            };
            (StatusCode::OK, Json(body)).into_response()
        }
    };

    if let (Some(cache_seconds), ModelMethod::Read) = (descriptor.cache_seconds, descriptor.method)
    {
        if let Ok(value) = HeaderValue::from_str(&format!("private, max-age={}", cache_seconds)) {
            response.headers_mut().insert(header::CACHE_CONTROL, value);
        }
    }

    Ok(response)
}

fn rate_bucket(config: &GatewayConfig, caller: &CallerContext) -> (String, RateQuota) {
    match caller.owner() {
        Some(owner) => (
            format!("user:{}", owner),
            config.api_rate_limit_authenticated,
        ),
        None => (format!("ip:{}", caller.source_ip), config.api_rate_limit),
    }
}

fn validate_page(params: &ValidatedParams) -> Result<i64, ApiError> {
    let page = params.first_number("page").unwrap_or(1.0);
    if page < 1.0 || page.fract() != 0.0 {
        return Err(ApiError::bad_request(
            "page",
            "Page must be a positive integer.",
        ));
    }
    Ok(page as i64)
}

fn paginate_envelope(
    headers: &HeaderMap,
    model_name: &str,
    page: i64,
    body: serde_json::Value,
) -> serde_json::Value {
    let count = body.get("count").and_then(|v| v.as_i64()).unwrap_or(0);
    let results = body.get("results").cloned().unwrap_or_else(|| json!([]));

    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    let page_url = |page: i64| format!("http://{}/api/{}/?page={}", host, model_name, page);

    let next = if page * PAGE_SIZE < count {
        json!(page_url(page + 1))
    } else {
        json!(null)
    };
    let previous = if page > 1 {
        json!(page_url(page - 1))
    } else {
        json!(null)
    };

    json!({
        "count": count,
        "next": next,
        "previous": previous,
        "results": results,
    })
}

fn body_pairs(headers: &HeaderMap, body: &Bytes) -> Result<Vec<(String, String)>, ApiError> {
    if body.is_empty() {
        return Ok(Vec::new());
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim())
        .unwrap_or("");

    match content_type {
        "application/x-www-form-urlencoded" => {
            serde_urlencoded::from_bytes::<Vec<(String, String)>>(body)
                .map_err(|_| ApiError::bad_request("__all__", "Malformed form body."))
        }
        "application/json" => {
            let value: serde_json::Value = serde_json::from_slice(body)
                .map_err(|_| ApiError::bad_request("__all__", "Malformed JSON body."))?;
            json_pairs(value)
        }
        _ => Err(ApiError::UnsupportedMediaType),
    }
}

fn json_pairs(value: serde_json::Value) -> Result<Vec<(String, String)>, ApiError> {
    let serde_json::Value::Object(map) = value else {
        return Err(ApiError::bad_request("__all__", "JSON body must be an object."));
    };

    let mut pairs = Vec::new();
    for (name, value) in map {
        match value {
            serde_json::Value::Array(items) => {
                for item in items {
                    let rendered = json_scalar(&name, item)?;
                    pairs.push((name.clone(), rendered));
                }
            }
            other => {
                let rendered = json_scalar(&name, other)?;
                pairs.push((name, rendered));
            }
        }
    }
    Ok(pairs)
}

fn json_scalar(name: &str, value: serde_json::Value) -> Result<String, ApiError> {
    match value {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Bool(b) => Ok(b.to_string()),
        _ => Err(ApiError::bad_request(name, "Unsupported JSON value.")),
    }
}

fn binary_response(bytes: Vec<u8>, filename: &str) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", filename)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    (StatusCode::OK, headers, bytes).into_response()
}

fn error_response(err: &ApiError) -> Response {
    let (status, body) = match err {
        ApiError::NotFound => (StatusCode::NOT_FOUND, json!({"error": "not found"})),
        ApiError::BadRequest(errors) => (StatusCode::BAD_REQUEST, json!({"errors": errors})),
        ApiError::PermissionDenied(permission) => (
            StatusCode::FORBIDDEN,
            json!({"error": format!("{} required", permission.name())}),
        ),
        ApiError::MethodNotAllowed => (
            StatusCode::METHOD_NOT_ALLOWED,
            json!({"error": "method not allowed"}),
        ),
        ApiError::UnsupportedMediaType => (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            json!({"error": "unsupported content type"}),
        ),
        ApiError::RateLimited => (
            StatusCode::TOO_MANY_REQUESTS,
            json!({"error": "rate limit exceeded"}),
        ),
        ApiError::Backend(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"error": "backend unavailable"}),
        ),
    };
    (status, Json(body)).into_response()
}

fn extract_source_ip(headers: &HeaderMap) -> IpAddr {
    let direct = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<IpAddr>().ok());

    direct
        .or_else(|| {
            headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .and_then(|v| v.trim().parse::<IpAddr>().ok())
        })
        .unwrap_or(UNKNOWN_SOURCE_IP)
}

fn is_ajax(headers: &HeaderMap) -> bool {
    headers
        .get("x-requested-with")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("XMLHttpRequest"))
}

fn extract_request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .and_then(sanitize_request_id)
        .unwrap_or_else(|| Ulid::new().to_string())
}

fn sanitize_request_id(raw: &str) -> Option<String> {
    const MAX_LEN: usize = 64;
    let mut out = String::with_capacity(raw.len().min(MAX_LEN));

    for ch in raw.chars() {
        if out.len() >= MAX_LEN {
            break;
        }
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
            out.push(ch);
        }
    }

    (!out.is_empty()).then_some(out)
}
