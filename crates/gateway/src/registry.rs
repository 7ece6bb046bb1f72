use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use crashgate_contracts::{ApiError, CallerContext, InvocationResult, PermissionSet};
use crashgate_policy::FieldPolicy;

use crate::adapters::AdapterError;
use crate::params::{ParamSpec, ValidatedParams};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelMethod {
    Read,
    Write,
}

/// One backend binding. Adapters receive validated, coerced parameters and
/// return their raw result; redaction happens after.
#[async_trait]
pub trait ModelAdapter: Send + Sync {
    async fn invoke(&self, params: &ValidatedParams) -> Result<InvocationResult, AdapterError>;
}

/// Static declaration of one API model. Built at process start, immutable
/// afterwards.
pub struct ModelDescriptor {
    pub name: &'static str,
    pub method: ModelMethod,
    pub params: Vec<ParamSpec>,
    /// Permissions required for any invocation at all.
    pub required_permissions: PermissionSet,
    /// All-or-nothing group guarding the binary form; possessing a subset
    /// grants nothing.
    pub binary_permissions: PermissionSet,
    /// Parameter (name, value) that switches the request to the binary
    /// form guarded by `binary_permissions`.
    pub binary_format: Option<(&'static str, &'static str)>,
    pub field_policy: FieldPolicy,
    /// Cache lifetime advertised on successful reads.
    pub cache_seconds: Option<u64>,
    /// Collection model paged by the gateway (`page`, fixed page size).
    pub paginate: bool,
    /// Drop locked protected fields from filter/facet parameters before
    /// the adapter runs.
    pub scrub_protected_params: bool,
}

impl ModelDescriptor {
    /// Baseline for struct-update registration literals.
    pub fn base(name: &'static str, method: ModelMethod) -> Self {
        Self {
            name,
            method,
            params: Vec::new(),
            required_permissions: PermissionSet::new(),
            binary_permissions: PermissionSet::new(),
            binary_format: None,
            field_policy: FieldPolicy::open(),
            cache_seconds: None,
            paginate: false,
            scrub_protected_params: false,
        }
    }

    pub fn is_binary_request(&self, params: &ValidatedParams) -> bool {
        match self.binary_format {
            None => false,
            Some((name, value)) => params.first_text(name) == Some(value),
        }
    }

    /// Strict superset checks: the required set gates the invocation, and a
    /// binary request additionally needs every permission in the binary
    /// group. Rejection happens here, before any adapter work, so binary
    /// resources are never partially redacted.
    pub fn check_permissions(
        &self,
        caller: &CallerContext,
        params: &ValidatedParams,
    ) -> Result<(), ApiError> {
        if let Some(missing) = caller.permissions.first_missing(&self.required_permissions) {
            return Err(ApiError::PermissionDenied(missing));
        }

        if self.is_binary_request(params) {
            if let Some(missing) = caller.permissions.first_missing(&self.binary_permissions) {
                return Err(ApiError::PermissionDenied(missing));
            }
        }

        Ok(())
    }
}

pub struct ModelEntry {
    pub descriptor: ModelDescriptor,
    pub adapter: Arc<dyn ModelAdapter>,
}

impl std::fmt::Debug for ModelEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelEntry")
            .field("descriptor", &self.descriptor.name)
            .finish_non_exhaustive()
    }
}

/// Name → descriptor + adapter table. Deprecated names are registered as
/// tombstones so they resolve to NotFound exactly like unknown names;
/// abstract bases are simply never registered.
#[derive(Default)]
pub struct ModelRegistry {
    models: HashMap<&'static str, ModelEntry>,
    deprecated: HashSet<&'static str>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: ModelDescriptor, adapter: Arc<dyn ModelAdapter>) {
        self.models.insert(
            descriptor.name,
            ModelEntry {
                descriptor,
                adapter,
            },
        );
    }

    pub fn deprecate(&mut self, name: &'static str) {
        self.deprecated.insert(name);
    }

    pub fn describe(&self, name: &str) -> Result<&ModelEntry, ApiError> {
        if self.deprecated.contains(name) {
            return Err(ApiError::NotFound);
        }
        self.models.get(name).ok_or(ApiError::NotFound)
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names = self.models.keys().copied().collect::<Vec<_>>();
        names.sort_unstable();
        names
    }
}
