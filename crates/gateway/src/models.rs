use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use crashgate_contracts::{InvocationResult, Permission, PermissionSet};
use crashgate_policy::FieldPolicy;
use serde_json::json;

use crate::adapters::{AdapterError, CrashDb, ObjectStore, ReprocessingQueue, SearchBackend};
use crate::params::{ParamSpec, ValidatedParams};
use crate::registry::{ModelAdapter, ModelDescriptor, ModelMethod, ModelRegistry};

/// Fixed page size for gateway-paginated collection models.
pub const PAGE_SIZE: i64 = 1000;

/// The concrete backends the model bindings run against.
pub struct Backends {
    pub search: Arc<dyn SearchBackend>,
    pub objects: Arc<dyn ObjectStore>,
    pub crash_db: Arc<dyn CrashDb>,
    pub queue: Arc<dyn ReprocessingQueue>,
}

/// Register every concrete model. Abstract middleware bases have no entry
/// here at all; deprecated names get tombstones.
pub fn build_registry(backends: &Backends) -> ModelRegistry {
    let mut registry = ModelRegistry::new();

    registry.register(
        ModelDescriptor {
            params: vec![ParamSpec::enumeration("product", &["good"]).required()],
            cache_seconds: Some(3600),
            ..ModelDescriptor::base("NoOp", ModelMethod::Read)
        },
        Arc::new(NoOpModel),
    );

    registry.register(
        ModelDescriptor {
            params: vec![ParamSpec::crash_id("crash_id").required()],
            field_policy: FieldPolicy::with_allowlist(PROCESSED_CRASH_FIELDS)
                .protect("url", Permission::ViewPii)
                .protect("user_comments", Permission::ViewPii)
                .protect("email", Permission::ViewPii),
            ..ModelDescriptor::base("ProcessedCrash", ModelMethod::Read)
        },
        Arc::new(ProcessedCrashModel {
            objects: backends.objects.clone(),
        }),
    );

    registry.register(
        ModelDescriptor {
            params: vec![
                ParamSpec::crash_id("crash_id").required(),
                ParamSpec::enumeration("format", &["meta", "raw"]).default_value("meta"),
            ],
            binary_permissions: PermissionSet::of(&[
                Permission::ViewPii,
                Permission::ViewRawDump,
            ]),
            binary_format: Some(("format", "raw")),
            field_policy: FieldPolicy::with_dynamic_allowlist(raw_crash_fields)
                .protect("Comments", Permission::ViewPii)
                .protect("URL", Permission::ViewPii)
                .protect("Email", Permission::ViewPii),
            ..ModelDescriptor::base("RawCrash", ModelMethod::Read)
        },
        Arc::new(RawCrashModel {
            objects: backends.objects.clone(),
        }),
    );

    let supersearch = Arc::new(SuperSearchModel {
        search: backends.search.clone(),
    });

    registry.register(
        ModelDescriptor {
            params: supersearch_schema(),
            field_policy: supersearch_policy(),
            scrub_protected_params: true,
            ..ModelDescriptor::base("SuperSearch", ModelMethod::Read)
        },
        supersearch.clone(),
    );

    registry.register(
        ModelDescriptor {
            params: supersearch_schema(),
            required_permissions: PermissionSet::of(&[Permission::ViewPii]),
            ..ModelDescriptor::base("SuperSearchUnredacted", ModelMethod::Read)
        },
        supersearch,
    );

    registry.register(
        ModelDescriptor {
            params: vec![ParamSpec::text("signatures").required().multiple()],
            ..ModelDescriptor::base("Bugs", ModelMethod::Read)
        },
        Arc::new(BugsModel {
            crash_db: backends.crash_db.clone(),
        }),
    );

    registry.register(
        ModelDescriptor {
            params: vec![ParamSpec::number("bug_ids").required().multiple()],
            ..ModelDescriptor::base("SignaturesByBugs", ModelMethod::Read)
        },
        Arc::new(SignaturesByBugsModel {
            crash_db: backends.crash_db.clone(),
        }),
    );

    registry.register(
        ModelDescriptor {
            params: vec![ParamSpec::text("signatures").required().multiple()],
            ..ModelDescriptor::base("SignatureFirstDate", ModelMethod::Read)
        },
        Arc::new(SignatureFirstDateModel {
            crash_db: backends.crash_db.clone(),
        }),
    );

    registry.register(
        ModelDescriptor {
            params: vec![ParamSpec::number("page").default_value("1")],
            paginate: true,
            ..ModelDescriptor::base("MissingProcessedCrash", ModelMethod::Read)
        },
        Arc::new(MissingProcessedCrashModel {
            crash_db: backends.crash_db.clone(),
        }),
    );

    registry.register(
        ModelDescriptor {
            params: vec![ParamSpec::crash_id("crash_ids").required().multiple()],
            required_permissions: PermissionSet::of(&[Permission::ReprocessCrashes]),
            ..ModelDescriptor::base("Reprocessing", ModelMethod::Write)
        },
        Arc::new(ReprocessingModel {
            queue: backends.queue.clone(),
        }),
    );

    registry.deprecate("Field");

    registry
}

const PROCESSED_CRASH_FIELDS: &[&str] = &[
    "addons_checked",
    "address",
    "build",
    "client_crash_date",
    "completed_datetime",
    "cpu_arch",
    "cpu_info",
    "date_processed",
    "last_crash",
    "os_name",
    "os_version",
    "process_type",
    "product",
    "reason",
    "release_channel",
    "signature",
    "success",
    "uptime",
    "uuid",
    "version",
    "url",
    "user_comments",
    "email",
];

/// The raw crash annotation set tracks the crash reporter clients and is
/// revised with them, hence the callable form.
fn raw_crash_fields() -> BTreeSet<&'static str> {
    [
        "AdapterDeviceID",
        "AdapterVendorID",
        "Add-ons",
        "AsyncShutdownTimeout",
        "BuildID",
        "CrashTime",
        "EMCheckCompatibility",
        "InstallTime",
        "Notes",
        "ProductID",
        "ProductName",
        "ReleaseChannel",
        "SecondsSinceLastCrash",
        "StartupTime",
        "Vendor",
        "Version",
        "submitted_timestamp",
        "uuid",
        "Comments",
        "URL",
        "Email",
    ]
    .into_iter()
    .collect()
}

fn supersearch_policy() -> FieldPolicy {
    FieldPolicy::open()
        .protect("url", Permission::ViewPii)
        .protect("user_comments", Permission::ViewPii)
        .protect("email", Permission::ViewPii)
}

fn supersearch_schema() -> Vec<ParamSpec> {
    vec![
        ParamSpec::text("signature").multiple(),
        ParamSpec::text("product").multiple(),
        ParamSpec::text("version").multiple(),
        ParamSpec::text("platform").multiple(),
        ParamSpec::text("release_channel").multiple(),
        ParamSpec::text("process_type").multiple(),
        ParamSpec::crash_id("uuid"),
        ParamSpec::number("build_id").multiple(),
        ParamSpec::number("uptime").multiple(),
        ParamSpec::date("date").multiple(),
        ParamSpec::boolean("is_garbage_collecting"),
        ParamSpec::flag("missing_symbols"),
        ParamSpec::text("url").multiple(),
        ParamSpec::text("user_comments").multiple(),
        ParamSpec::text("email").multiple(),
        ParamSpec::text("_facets").multiple(),
        ParamSpec::text("_columns").multiple(),
        ParamSpec::text("_aggs.signature").multiple(),
        ParamSpec::text("_histogram.date").multiple(),
        ParamSpec::text("_sort").multiple(),
        ParamSpec::number("_results_number"),
        ParamSpec::number("_results_offset"),
    ]
}

fn is_aggregation_param(name: &str) -> bool {
    name == "_facets"
        || name == "_columns"
        || name.starts_with("_aggs.")
        || name.starts_with("_histogram.")
}

/// Remove locked protected fields from the request itself: both as filter
/// parameters and as names inside facet/column/aggregation lists. Protected
/// data must not leak through facet counts.
pub fn scrub_protected_params(
    policy: &FieldPolicy,
    granted: &PermissionSet,
    params: &mut ValidatedParams,
) {
    let locked: Vec<&'static str> = policy
        .protected_fields()
        .filter(|(_, permission)| !granted.contains(*permission))
        .map(|(field, _)| field)
        .collect();

    if locked.is_empty() {
        return;
    }

    for field in &locked {
        params.remove(field);
    }

    let mut emptied = Vec::new();
    for (name, value) in params.iter_mut() {
        if !is_aggregation_param(name) {
            continue;
        }
        value.retain(|constraint| {
            constraint
                .text()
                .is_none_or(|field| !locked.contains(&field))
        });
        if value.is_empty() {
            emptied.push(name.clone());
        }
    }
    for name in emptied {
        params.remove(&name);
    }
}

/// Wire payload for the search backend: every parameter becomes a list of
/// rendered constraint strings.
pub fn search_payload(params: &ValidatedParams) -> serde_json::Value {
    let mut payload = serde_json::Map::new();
    for (name, value) in params.iter() {
        let rendered = value
            .constraints()
            .iter()
            .map(|constraint| serde_json::Value::String(constraint.render()))
            .collect::<Vec<_>>();
        payload.insert(name.clone(), serde_json::Value::Array(rendered));
    }
    serde_json::Value::Object(payload)
}

fn required_text(params: &ValidatedParams, name: &str) -> Result<String, AdapterError> {
    params
        .first_text(name)
        .map(|s| s.to_string())
        .ok_or_else(|| AdapterError::Internal(format!("validated params missing `{}`", name)))
}

pub(crate) fn processed_crash_key(crash_id: &str) -> String {
    format!("v1/processed_crash/{}", crash_id)
}

pub(crate) fn raw_crash_key(crash_id: &str) -> String {
    // Keys shard by submission date, taken from the id's trailing YYMMDD.
    format!("v1/raw_crash/20{}/{}", &crash_id[30..], crash_id)
}

pub(crate) fn dump_key(crash_id: &str) -> String {
    format!("v1/dump/{}", crash_id)
}

struct NoOpModel;

#[async_trait]
impl ModelAdapter for NoOpModel {
    async fn invoke(&self, params: &ValidatedParams) -> Result<InvocationResult, AdapterError> {
        let product = required_text(params, "product")?;
        Ok(InvocationResult::Json(json!({
            "product": product,
            "ok": true,
        })))
    }
}

struct ProcessedCrashModel {
    objects: Arc<dyn ObjectStore>,
}

#[async_trait]
impl ModelAdapter for ProcessedCrashModel {
    async fn invoke(&self, params: &ValidatedParams) -> Result<InvocationResult, AdapterError> {
        let crash_id = required_text(params, "crash_id")?;
        let bytes = self
            .objects
            .get(&processed_crash_key(&crash_id))
            .await?
            .ok_or(AdapterError::NotFound)?;

        let record =
            serde_json::from_slice(&bytes).map_err(|_| AdapterError::InvalidResponse)?;
        Ok(InvocationResult::Json(record))
    }
}

struct RawCrashModel {
    objects: Arc<dyn ObjectStore>,
}

#[async_trait]
impl ModelAdapter for RawCrashModel {
    async fn invoke(&self, params: &ValidatedParams) -> Result<InvocationResult, AdapterError> {
        let crash_id = required_text(params, "crash_id")?;

        if params.first_text("format") == Some("raw") {
            let bytes = self
                .objects
                .get(&dump_key(&crash_id))
                .await?
                .ok_or(AdapterError::NotFound)?;
            return Ok(InvocationResult::Binary {
                bytes,
                filename: format!("{}.dmp", crash_id),
            });
        }

        let bytes = self
            .objects
            .get(&raw_crash_key(&crash_id))
            .await?
            .ok_or(AdapterError::NotFound)?;
        let record =
            serde_json::from_slice(&bytes).map_err(|_| AdapterError::InvalidResponse)?;
        Ok(InvocationResult::Json(record))
    }
}

struct SuperSearchModel {
    search: Arc<dyn SearchBackend>,
}

#[async_trait]
impl ModelAdapter for SuperSearchModel {
    async fn invoke(&self, params: &ValidatedParams) -> Result<InvocationResult, AdapterError> {
        let result = self.search.search(&search_payload(params)).await?;
        Ok(InvocationResult::Json(json!({
            "hits": result.hits,
            "facets": result.facets,
            "total": result.total,
        })))
    }
}

struct BugsModel {
    crash_db: Arc<dyn CrashDb>,
}

#[async_trait]
impl ModelAdapter for BugsModel {
    async fn invoke(&self, params: &ValidatedParams) -> Result<InvocationResult, AdapterError> {
        let signatures = params.texts("signatures");
        let rows = self.crash_db.bugs_for_signatures(&signatures).await?;
        Ok(hits_envelope(
            rows.iter()
                .map(|row| json!({"id": row.id, "signature": row.signature}))
                .collect(),
        ))
    }
}

struct SignaturesByBugsModel {
    crash_db: Arc<dyn CrashDb>,
}

#[async_trait]
impl ModelAdapter for SignaturesByBugsModel {
    async fn invoke(&self, params: &ValidatedParams) -> Result<InvocationResult, AdapterError> {
        let bug_ids = params
            .numbers("bug_ids")
            .into_iter()
            .map(|n| n as i64)
            .collect::<Vec<_>>();
        let rows = self.crash_db.signatures_for_bugs(&bug_ids).await?;
        Ok(hits_envelope(
            rows.iter()
                .map(|row| json!({"id": row.id, "signature": row.signature}))
                .collect(),
        ))
    }
}

struct SignatureFirstDateModel {
    crash_db: Arc<dyn CrashDb>,
}

#[async_trait]
impl ModelAdapter for SignatureFirstDateModel {
    async fn invoke(&self, params: &ValidatedParams) -> Result<InvocationResult, AdapterError> {
        let signatures = params.texts("signatures");
        let rows = self
            .crash_db
            .first_dates_for_signatures(&signatures)
            .await?;
        Ok(hits_envelope(
            rows.iter()
                .map(|row| {
                    json!({
                        "signature": row.signature,
                        "first_date": row.first_date,
                        "first_build": row.first_build,
                    })
                })
                .collect(),
        ))
    }
}

fn hits_envelope(hits: Vec<serde_json::Value>) -> InvocationResult {
    let total = hits.len();
    InvocationResult::Json(json!({"hits": hits, "total": total}))
}

struct MissingProcessedCrashModel {
    crash_db: Arc<dyn CrashDb>,
}

#[async_trait]
impl ModelAdapter for MissingProcessedCrashModel {
    async fn invoke(&self, params: &ValidatedParams) -> Result<InvocationResult, AdapterError> {
        let page = params.first_number("page").unwrap_or(1.0).max(1.0) as i64;
        let offset = (page - 1) * PAGE_SIZE;
        let (count, rows) = self
            .crash_db
            .missing_processed_page(offset, PAGE_SIZE)
            .await?;

        let results = rows
            .iter()
            .map(|row| {
                json!({
                    "crash_id": row.crash_id,
                    "created": row.created,
                    "is_processed": row.is_processed,
                })
            })
            .collect::<Vec<_>>();

        Ok(InvocationResult::Json(json!({
            "count": count,
            "results": results,
        })))
    }
}

struct ReprocessingModel {
    queue: Arc<dyn ReprocessingQueue>,
}

#[async_trait]
impl ModelAdapter for ReprocessingModel {
    async fn invoke(&self, params: &ValidatedParams) -> Result<InvocationResult, AdapterError> {
        let crash_ids = params.texts("crash_ids");
        self.queue.publish(&crash_ids).await?;
        Ok(InvocationResult::Json(json!(true)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{MemoryCrashDb, MemoryObjectStore, MemoryQueue, MemorySearch};
    use crate::params::validate;

    const CRASH_ID: &str = "11cb72f5-eb28-41e1-a8e4-849982120611";

    fn test_backends() -> Backends {
        Backends {
            search: Arc::new(MemorySearch::with_hits(Vec::new())),
            objects: Arc::new(MemoryObjectStore::new()),
            crash_db: Arc::new(MemoryCrashDb::default()),
            queue: Arc::new(MemoryQueue::default()),
        }
    }

    #[test]
    fn registry_exposes_the_public_model_list() {
        let registry = build_registry(&test_backends());
        assert_eq!(
            registry.names(),
            vec![
                "Bugs",
                "MissingProcessedCrash",
                "NoOp",
                "ProcessedCrash",
                "RawCrash",
                "Reprocessing",
                "SignatureFirstDate",
                "SignaturesByBugs",
                "SuperSearch",
                "SuperSearchUnredacted",
            ]
        );
    }

    #[test]
    fn object_store_keys_shard_raw_crashes_by_date() {
        assert_eq!(
            processed_crash_key(CRASH_ID),
            "v1/processed_crash/11cb72f5-eb28-41e1-a8e4-849982120611"
        );
        assert_eq!(
            raw_crash_key(CRASH_ID),
            "v1/raw_crash/20120611/11cb72f5-eb28-41e1-a8e4-849982120611"
        );
        assert_eq!(
            dump_key(CRASH_ID),
            "v1/dump/11cb72f5-eb28-41e1-a8e4-849982120611"
        );
    }

    #[test]
    fn scrubbing_removes_locked_filters_and_facet_names() {
        let schema = supersearch_schema();
        let raw = vec![
            ("url".to_string(), "example.com".to_string()),
            ("product".to_string(), "WaterWolf".to_string()),
            ("_facets".to_string(), "url,product".to_string()),
            ("_aggs.signature".to_string(), "url".to_string()),
            ("_histogram.date".to_string(), "url,product".to_string()),
        ];
        let mut params = validate(&schema, &raw).unwrap();

        scrub_protected_params(&supersearch_policy(), &PermissionSet::new(), &mut params);

        assert!(params.get("url").is_none());
        assert_eq!(params.texts("product"), vec!["WaterWolf"]);
        assert_eq!(params.texts("_facets"), vec!["product"]);
        // A facet list reduced to nothing disappears entirely.
        assert!(params.get("_aggs.signature").is_none());
        assert_eq!(params.texts("_histogram.date"), vec!["product"]);
    }

    #[test]
    fn scrubbing_is_a_no_op_with_the_unlocking_permission() {
        let schema = supersearch_schema();
        let raw = vec![
            ("url".to_string(), "example.com".to_string()),
            ("_facets".to_string(), "url".to_string()),
        ];
        let mut params = validate(&schema, &raw).unwrap();
        let before = params.clone();

        let granted = PermissionSet::of(&[Permission::ViewPii]);
        scrub_protected_params(&supersearch_policy(), &granted, &mut params);
        assert_eq!(params, before);
    }

    #[test]
    fn search_payload_renders_constraint_lists() {
        let schema = supersearch_schema();
        let raw = vec![
            ("product".to_string(), "WaterWolf".to_string()),
            ("product".to_string(), "NightTrain".to_string()),
            ("date".to_string(), ">=2022-06-05".to_string()),
        ];
        let params = validate(&schema, &raw).unwrap();

        let payload = search_payload(&params);
        assert_eq!(payload["product"], json!(["WaterWolf", "NightTrain"]));
        assert_eq!(payload["date"], json!([">=2022-06-05"]));
    }

    #[tokio::test]
    async fn raw_crash_switches_between_meta_and_dump() {
        let objects = MemoryObjectStore::new()
            .with_json(&raw_crash_key(CRASH_ID), &json!({"ProductName": "WaterWolf"}))
            .with_object(&dump_key(CRASH_ID), vec![0xe0, 0x01]);
        let model = RawCrashModel {
            objects: Arc::new(objects),
        };

        let schema = vec![
            ParamSpec::crash_id("crash_id").required(),
            ParamSpec::enumeration("format", &["meta", "raw"]).default_value("meta"),
        ];

        let raw = vec![("crash_id".to_string(), CRASH_ID.to_string())];
        let params = validate(&schema, &raw).unwrap();
        match model.invoke(&params).await.unwrap() {
            InvocationResult::Json(value) => {
                assert_eq!(value["ProductName"], json!("WaterWolf"));
            }
            other => panic!("expected JSON result, got {:?}", other),
        }

        let raw = vec![
            ("crash_id".to_string(), CRASH_ID.to_string()),
            ("format".to_string(), "raw".to_string()),
        ];
        let params = validate(&schema, &raw).unwrap();
        match model.invoke(&params).await.unwrap() {
            InvocationResult::Binary { bytes, filename } => {
                assert_eq!(bytes, vec![0xe0, 0x01]);
                assert_eq!(filename, format!("{}.dmp", CRASH_ID));
            }
            other => panic!("expected binary result, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn missing_record_maps_to_not_found() {
        let model = ProcessedCrashModel {
            objects: Arc::new(MemoryObjectStore::new()),
        };
        let schema = vec![ParamSpec::crash_id("crash_id").required()];
        let raw = vec![("crash_id".to_string(), CRASH_ID.to_string())];
        let params = validate(&schema, &raw).unwrap();

        match model.invoke(&params).await {
            Err(AdapterError::NotFound) => {}
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn reprocessing_publishes_validated_ids() {
        let queue = Arc::new(MemoryQueue::default());
        let model = ReprocessingModel {
            queue: queue.clone(),
        };
        let schema = vec![ParamSpec::crash_id("crash_ids").required().multiple()];
        let raw = vec![("crash_ids".to_string(), CRASH_ID.to_string())];
        let params = validate(&schema, &raw).unwrap();

        match model.invoke(&params).await.unwrap() {
            InvocationResult::Json(value) => assert_eq!(value, json!(true)),
            other => panic!("expected JSON true, got {:?}", other),
        }
        assert_eq!(
            queue.published.lock().unwrap().as_slice(),
            &[vec![CRASH_ID.to_string()]]
        );
    }
}
