use std::collections::BTreeMap;
use std::collections::BTreeSet;

use crashgate_contracts::{Permission, PermissionSet};
use serde_json::Value;

/// Which fields of a model's records are exposed at all. `Dynamic` exists
/// for models whose field set varies with the dataset version; the callable
/// must be pure and must not close over caller state.
#[derive(Debug, Clone)]
pub enum Allowlist {
    All,
    Fields(BTreeSet<&'static str>),
    Dynamic(fn() -> BTreeSet<&'static str>),
}

impl Allowlist {
    fn allows(&self, key: &str) -> bool {
        match self {
            Allowlist::All => true,
            Allowlist::Fields(fields) => fields.contains(key),
            Allowlist::Dynamic(fields) => fields().contains(key),
        }
    }
}

/// Declarative field policy for one model: an allowlist plus per-field
/// protection annotations mapping field name to the permission that unlocks
/// it. Registered once at startup, read-only afterwards.
#[derive(Debug, Clone)]
pub struct FieldPolicy {
    allow: Allowlist,
    protected: BTreeMap<&'static str, Permission>,
}

impl FieldPolicy {
    pub fn open() -> Self {
        Self {
            allow: Allowlist::All,
            protected: BTreeMap::new(),
        }
    }

    pub fn with_allowlist(fields: &[&'static str]) -> Self {
        Self {
            allow: Allowlist::Fields(fields.iter().copied().collect()),
            protected: BTreeMap::new(),
        }
    }

    pub fn with_dynamic_allowlist(fields: fn() -> BTreeSet<&'static str>) -> Self {
        Self {
            allow: Allowlist::Dynamic(fields),
            protected: BTreeMap::new(),
        }
    }

    pub fn protect(mut self, field: &'static str, permission: Permission) -> Self {
        self.protected.insert(field, permission);
        self
    }

    /// Permission required to see `key`, if the field is protected.
    pub fn protection(&self, key: &str) -> Option<Permission> {
        self.protected.get(key).copied()
    }

    pub fn protected_fields(&self) -> impl Iterator<Item = (&'static str, Permission)> + '_ {
        self.protected.iter().map(|(k, v)| (*k, *v))
    }

    /// Protection check alone: true unless `key` is protected and the
    /// caller's permissions do not unlock it.
    pub fn unlocked(&self, key: &str, granted: &PermissionSet) -> bool {
        match self.protection(key) {
            None => true,
            Some(permission) => granted.contains(permission),
        }
    }

    /// Full per-key decision: the key must be allowlisted and unlocked.
    pub fn keeps(&self, key: &str, granted: &PermissionSet) -> bool {
        self.allow.allows(key) && self.unlocked(key, granted)
    }
}

/// Build a filtered copy of `value` under `policy` for a caller holding
/// `granted`. The input is never mutated; adapter-level caches stay safe.
///
/// A top-level object is treated as a record: the allowlist and protection
/// annotations both apply to its keys. Arrays are collections: each element
/// is redacted independently, so one locked row never fails the response.
/// Below the record's top level only protection applies.
pub fn redact(policy: &FieldPolicy, granted: &PermissionSet, value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, field) in map {
                if policy.keeps(key, granted) {
                    out.insert(key.clone(), strip_protected(policy, granted, field));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| redact(policy, granted, item))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn strip_protected(policy: &FieldPolicy, granted: &PermissionSet, value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, field) in map {
                if policy.unlocked(key, granted) {
                    out.insert(key.clone(), strip_protected(policy, granted, field));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| strip_protected(policy, granted, item))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pii_policy() -> FieldPolicy {
        FieldPolicy::open()
            .protect("url", Permission::ViewPii)
            .protect("user_comments", Permission::ViewPii)
    }

    #[test]
    fn protected_fields_are_dropped_without_the_permission() {
        let record = json!({
            "signature": "OOM | small",
            "url": "https://example.com",
            "user_comments": "hello"
        });

        let redacted = redact(&pii_policy(), &PermissionSet::new(), &record);
        assert_eq!(redacted, json!({"signature": "OOM | small"}));

        let granted = PermissionSet::of(&[Permission::ViewPii]);
        let kept = redact(&pii_policy(), &granted, &record);
        assert_eq!(kept, record);
    }

    #[test]
    fn collection_elements_are_redacted_independently() {
        let result = json!({
            "hits": [
                {"signature": "a", "url": "https://one.example.com"},
                {"signature": "b"}
            ],
            "total": 2
        });

        let redacted = redact(&pii_policy(), &PermissionSet::new(), &result);
        assert_eq!(
            redacted,
            json!({
                "hits": [
                    {"signature": "a"},
                    {"signature": "b"}
                ],
                "total": 2
            })
        );
    }

    #[test]
    fn redaction_does_not_mutate_the_input() {
        let record = json!({"signature": "a", "url": "https://example.com"});
        let before = record.clone();
        let _ = redact(&pii_policy(), &PermissionSet::new(), &record);
        assert_eq!(record, before);
    }

    #[test]
    fn allowlist_drops_undeclared_fields() {
        let policy = FieldPolicy::with_allowlist(&["signature", "product", "url"])
            .protect("url", Permission::ViewPii);

        let record = json!({
            "signature": "a",
            "product": "WaterWolf",
            "internal_note": "never shown",
            "url": "https://example.com"
        });

        let redacted = redact(&policy, &PermissionSet::new(), &record);
        assert_eq!(redacted, json!({"signature": "a", "product": "WaterWolf"}));

        let granted = PermissionSet::of(&[Permission::ViewPii]);
        let kept = redact(&policy, &granted, &record);
        assert_eq!(
            kept,
            json!({
                "signature": "a",
                "product": "WaterWolf",
                "url": "https://example.com"
            })
        );
    }

    #[test]
    fn dynamic_allowlist_is_evaluated_per_call() {
        fn fields() -> BTreeSet<&'static str> {
            ["signature"].into_iter().collect()
        }

        let policy = FieldPolicy::with_dynamic_allowlist(fields);
        let record = json!({"signature": "a", "extra": 1});
        let redacted = redact(&policy, &PermissionSet::new(), &record);
        assert_eq!(redacted, json!({"signature": "a"}));
    }

    #[test]
    fn protection_applies_below_the_record_top_level() {
        let record = json!({
            "signature": "a",
            "extra": {"url": "https://example.com", "depth": 1}
        });

        let redacted = redact(&pii_policy(), &PermissionSet::new(), &record);
        assert_eq!(
            redacted,
            json!({"signature": "a", "extra": {"depth": 1}})
        );
    }

    #[test]
    fn binary_style_scalars_pass_through_untouched() {
        let value = json!("plain string result");
        assert_eq!(redact(&pii_policy(), &PermissionSet::new(), &value), value);
    }
}
