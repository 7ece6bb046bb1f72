use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};

pub mod canonical;

/// Closed set of permissions the gateway knows about. Fields and models
/// reference these; anything else a token or session claims is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    ViewPii,
    ViewRawDump,
    ReprocessCrashes,
}

impl Permission {
    pub const ALL: [Permission; 3] = [
        Permission::ViewPii,
        Permission::ViewRawDump,
        Permission::ReprocessCrashes,
    ];

    /// Stable identifier used in token records and session claims.
    pub fn codename(self) -> &'static str {
        match self {
            Permission::ViewPii => "view_pii",
            Permission::ViewRawDump => "view_rawdump",
            Permission::ReprocessCrashes => "reprocess_crashes",
        }
    }

    /// Human-readable name used in permission-denied responses.
    pub fn name(self) -> &'static str {
        match self {
            Permission::ViewPii => "View Personal Identifiable Information",
            Permission::ViewRawDump => "View Raw Dumps",
            Permission::ReprocessCrashes => "Reprocess Crashes",
        }
    }

    pub fn from_codename(codename: &str) -> Option<Self> {
        Permission::ALL
            .into_iter()
            .find(|p| p.codename() == codename)
    }
}

/// Explicit finite permission set. Superset/subset checks are set
/// operations, never duck-typed iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionSet(BTreeSet<Permission>);

impl PermissionSet {
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    pub fn of(permissions: &[Permission]) -> Self {
        Self(permissions.iter().copied().collect())
    }

    pub fn insert(&mut self, permission: Permission) {
        self.0.insert(permission);
    }

    pub fn contains(&self, permission: Permission) -> bool {
        self.0.contains(&permission)
    }

    /// True when `self` covers every permission in `required`.
    pub fn contains_all(&self, required: &PermissionSet) -> bool {
        self.0.is_superset(&required.0)
    }

    /// First permission in `required` that `self` lacks, if any.
    pub fn first_missing(&self, required: &PermissionSet) -> Option<Permission> {
        required.0.iter().copied().find(|p| !self.0.contains(p))
    }

    pub fn union(&self, other: &PermissionSet) -> PermissionSet {
        Self(self.0.union(&other.0).copied().collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = Permission> + '_ {
        self.0.iter().copied()
    }

    pub fn codenames(&self) -> Vec<String> {
        self.0.iter().map(|p| p.codename().to_string()).collect()
    }

    pub fn from_codenames<'a>(codenames: impl IntoIterator<Item = &'a str>) -> Self {
        Self(
            codenames
                .into_iter()
                .filter_map(Permission::from_codename)
                .collect(),
        )
    }
}

impl FromIterator<Permission> for PermissionSet {
    fn from_iter<T: IntoIterator<Item = Permission>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// How the caller proved who they are, if at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    Anonymous,
    Session { user: String },
    Token { owner: String },
}

/// Resolved identity and permission set for one request. Built per request,
/// discarded after.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerContext {
    pub auth: AuthState,
    pub permissions: PermissionSet,
    pub source_ip: IpAddr,
}

impl CallerContext {
    pub fn anonymous(source_ip: IpAddr) -> Self {
        Self {
            auth: AuthState::Anonymous,
            permissions: PermissionSet::new(),
            source_ip,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        !matches!(self.auth, AuthState::Anonymous)
    }

    pub fn owner(&self) -> Option<&str> {
        match &self.auth {
            AuthState::Anonymous => None,
            AuthState::Session { user } => Some(user),
            AuthState::Token { owner } => Some(owner),
        }
    }
}

pub const UNKNOWN_SOURCE_IP: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

/// Per-parameter validation messages, keyed by parameter name.
pub type ParamErrors = BTreeMap<String, Vec<String>>;

/// Error taxonomy for one gateway invocation. The HTTP surface maps each
/// variant to a status code and JSON body in exactly one place.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiError {
    NotFound,
    BadRequest(ParamErrors),
    PermissionDenied(Permission),
    MethodNotAllowed,
    UnsupportedMediaType,
    RateLimited,
    Backend(String),
}

impl ApiError {
    pub fn bad_request(param: &str, message: &str) -> Self {
        let mut errors = ParamErrors::new();
        errors.insert(param.to_string(), vec![message.to_string()]);
        ApiError::BadRequest(errors)
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::NotFound => write!(f, "not found"),
            ApiError::BadRequest(errors) => {
                write!(f, "invalid parameters: ")?;
                for (idx, name) in errors.keys().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", name)?;
                }
                Ok(())
            }
            ApiError::PermissionDenied(permission) => {
                write!(f, "{} required", permission.name())
            }
            ApiError::MethodNotAllowed => write!(f, "method not allowed"),
            ApiError::UnsupportedMediaType => write!(f, "unsupported media type"),
            ApiError::RateLimited => write!(f, "rate limit exceeded"),
            ApiError::Backend(message) => write!(f, "backend error: {}", message),
        }
    }
}

impl std::error::Error for ApiError {}

/// Result of one adapter invocation: either JSON handed to the redactor, or
/// an all-or-nothing binary payload that bypasses field redaction entirely.
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationResult {
    Json(serde_json::Value),
    Binary { bytes: Vec<u8>, filename: String },
}

impl InvocationResult {
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            InvocationResult::Json(value) => Some(value),
            InvocationResult::Binary { .. } => None,
        }
    }
}
