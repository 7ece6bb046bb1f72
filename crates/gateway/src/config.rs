use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::rate_limit::RateQuota;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub db_url: Option<String>,
    pub search_url: Option<String>,
    pub crash_store_path: String,
    pub search_timeout_ms: u64,
    pub search_cache_max_entries: usize,
    pub search_cache_ttl_ms: u64,
    pub db_query_timeout_ms: u64,
    pub api_rate_limit: RateQuota,
    pub api_rate_limit_authenticated: RateQuota,
    pub session_secret: Option<String>,
    pub session_issuer: String,
    pub session_clock_skew_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for StartupError {}

impl GatewayConfig {
    pub fn load() -> Result<Self, StartupError> {
        let mut merged = HashMap::new();

        if let Ok(config_path) = std::env::var("CRASHGATE_CONFIG_PATH") {
            let config_path = config_path.trim();
            if !config_path.is_empty() {
                let file_kv = parse_env_file(config_path)?;
                merged.extend(file_kv);
            }
        }

        merged.extend(std::env::vars());

        Self::from_kv(&merged)
    }

    pub fn from_kv(kv: &HashMap<String, String>) -> Result<Self, StartupError> {
        let bind_addr = parse_socket_addr(
            kv.get("CRASHGATE_BIND_ADDR"),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080),
            "CRASHGATE_BIND_ADDR",
        )?;

        let session_secret = optional(kv, "CRASHGATE_SESSION_SECRET");

        let dev_allow_nonlocal_bind =
            parse_bool(kv.get("CRASHGATE_DEV_ALLOW_NONLOCAL_BIND")).unwrap_or(false);

        if !bind_addr.ip().is_loopback() && session_secret.is_none() {
            if dev_allow_nonlocal_bind && is_unspecified_ip(bind_addr.ip()) {
                // Explicit dev-only escape hatch for docker compose / local containers.
            } else {
                return Err(StartupError {
                    code: "ERR_NONLOCAL_BIND_REQUIRES_AUTH",
                    message: "non-local bind requires session auth config; refuse startup"
                        .to_string(),
                });
            }
        }

        let db_url = optional(kv, "CRASHGATE_DB_URL");
        let search_url = optional(kv, "CRASHGATE_SEARCH_URL");

        let crash_store_path = kv
            .get("CRASHGATE_CRASH_STORE_PATH")
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .unwrap_or("fixtures/crash_store")
            .to_string();

        let search_timeout_ms = parse_u64(
            kv.get("CRASHGATE_SEARCH_TIMEOUT_MS"),
            500,
            "CRASHGATE_SEARCH_TIMEOUT_MS",
        )?;

        let search_cache_max_entries = parse_usize(
            kv.get("CRASHGATE_SEARCH_CACHE_MAX_ENTRIES"),
            512,
            "CRASHGATE_SEARCH_CACHE_MAX_ENTRIES",
        )?;

        let search_cache_ttl_ms = parse_u64(
            kv.get("CRASHGATE_SEARCH_CACHE_TTL_MS"),
            10_000,
            "CRASHGATE_SEARCH_CACHE_TTL_MS",
        )?;

        let db_query_timeout_ms = parse_u64(
            kv.get("CRASHGATE_DB_QUERY_TIMEOUT_MS"),
            2000,
            "CRASHGATE_DB_QUERY_TIMEOUT_MS",
        )?;

        let api_rate_limit = parse_rate_quota(
            kv.get("CRASHGATE_API_RATE_LIMIT"),
            "100/m",
            "CRASHGATE_API_RATE_LIMIT",
        )?;

        let api_rate_limit_authenticated = parse_rate_quota(
            kv.get("CRASHGATE_API_RATE_LIMIT_AUTHENTICATED"),
            "500/m",
            "CRASHGATE_API_RATE_LIMIT_AUTHENTICATED",
        )?;

        let session_issuer = kv
            .get("CRASHGATE_SESSION_ISSUER")
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .unwrap_or("crashgate")
            .to_string();

        let session_clock_skew_secs = parse_u64(
            kv.get("CRASHGATE_SESSION_CLOCK_SKEW_SECS"),
            60,
            "CRASHGATE_SESSION_CLOCK_SKEW_SECS",
        )?;

        Ok(Self {
            bind_addr,
            db_url,
            search_url,
            crash_store_path,
            search_timeout_ms,
            search_cache_max_entries,
            search_cache_ttl_ms,
            db_query_timeout_ms,
            api_rate_limit,
            api_rate_limit_authenticated,
            session_secret,
            session_issuer,
            session_clock_skew_secs,
        })
    }
}

fn parse_env_file(path: &str) -> Result<HashMap<String, String>, StartupError> {
    let contents = std::fs::read_to_string(path).map_err(|_| StartupError {
        code: "ERR_CONFIG_FILE_READ",
        message: format!("failed to read config file at {}", path),
    })?;

    let mut kv = HashMap::new();

    for (idx, raw_line) in contents.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| StartupError {
            code: "ERR_CONFIG_FILE_PARSE",
            message: format!("invalid config line {} (expected KEY=VALUE)", idx + 1),
        })?;

        let key = key.trim();
        if key.is_empty() {
            return Err(StartupError {
                code: "ERR_CONFIG_FILE_PARSE",
                message: format!("invalid config line {} (empty key)", idx + 1),
            });
        }

        let mut value = value.trim().to_string();
        value = strip_quotes(&value);
        kv.insert(key.to_string(), value);
    }

    Ok(kv)
}

fn strip_quotes(s: &str) -> String {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return s[1..bytes.len() - 1].to_string();
        }
    }
    s.to_string()
}

fn optional(kv: &HashMap<String, String>, key: &'static str) -> Option<String> {
    kv.get(key)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn parse_socket_addr(
    value: Option<&String>,
    default: SocketAddr,
    key: &'static str,
) -> Result<SocketAddr, StartupError> {
    match value {
        None => Ok(default),
        Some(v) => v.parse::<SocketAddr>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be a valid host:port socket address", key),
        }),
    }
}

fn parse_usize(
    value: Option<&String>,
    default: usize,
    key: &'static str,
) -> Result<usize, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.parse::<usize>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

fn parse_u64(value: Option<&String>, default: u64, key: &'static str) -> Result<u64, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.parse::<u64>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

fn parse_rate_quota(
    value: Option<&String>,
    default: &str,
    key: &'static str,
) -> Result<RateQuota, StartupError> {
    let raw = value
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or(default);

    RateQuota::parse(raw).ok_or_else(|| StartupError {
        code: "ERR_INVALID_CONFIG",
        message: format!("{} must look like `100/m`", key),
    })
}

fn parse_bool(value: Option<&String>) -> Option<bool> {
    let value = value.map(|v| v.trim()).filter(|v| !v.is_empty())?;

    match value {
        "1" | "true" | "TRUE" | "yes" | "YES" => Some(true),
        "0" | "false" | "FALSE" | "no" | "NO" => Some(false),
        _ => None,
    }
}

fn is_unspecified_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_unspecified(),
        IpAddr::V6(v6) => v6.is_unspecified(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn defaults_apply_with_an_empty_environment() {
        let config = GatewayConfig::from_kv(&HashMap::new()).unwrap();
        assert!(config.bind_addr.ip().is_loopback());
        assert_eq!(config.api_rate_limit.limit, 100);
        assert_eq!(config.api_rate_limit.window, Duration::from_secs(60));
        assert_eq!(config.api_rate_limit_authenticated.limit, 500);
        assert_eq!(config.crash_store_path, "fixtures/crash_store");
        assert!(config.session_secret.is_none());
    }

    #[test]
    fn non_local_bind_without_session_auth_fails() {
        let mut env = HashMap::new();
        env.insert(
            "CRASHGATE_BIND_ADDR".to_string(),
            "0.0.0.0:8080".to_string(),
        );
        let err = GatewayConfig::from_kv(&env).unwrap_err();
        assert_eq!(err.code, "ERR_NONLOCAL_BIND_REQUIRES_AUTH");

        env.insert(
            "CRASHGATE_SESSION_SECRET".to_string(),
            "a-long-shared-secret".to_string(),
        );
        assert!(GatewayConfig::from_kv(&env).is_ok());
    }

    #[test]
    fn bad_rate_limit_strings_fail_fast() {
        let mut env = HashMap::new();
        env.insert(
            "CRASHGATE_API_RATE_LIMIT".to_string(),
            "lots/m".to_string(),
        );
        let err = GatewayConfig::from_kv(&env).unwrap_err();
        assert_eq!(err.code, "ERR_INVALID_CONFIG");
    }

    #[test]
    fn rate_limits_parse_from_the_short_form() {
        let mut env = HashMap::new();
        env.insert("CRASHGATE_API_RATE_LIMIT".to_string(), "3/m".to_string());
        env.insert(
            "CRASHGATE_API_RATE_LIMIT_AUTHENTICATED".to_string(),
            "6/m".to_string(),
        );
        let config = GatewayConfig::from_kv(&env).unwrap();
        assert_eq!(config.api_rate_limit.limit, 3);
        assert_eq!(config.api_rate_limit_authenticated.limit, 6);
    }
}
