//! RunState schema migration
//!
//! Version 1 documents were flat:
//!
//! ```text
//! { "job_id", "parent_job_id", "created_at", "updated_at", "completed_at",
//!   "status", "completed_stages", "failed_stages", "stage_attempts",
//!   "stage_errors", "dataset_hash", "dataset_size", "completeness_percent",
//!   "gap_count", "gaps", "duration_seconds", "api_calls", "estimated_cost",
//!   "cache_hits", "cache_misses" }
//! ```
//!
//! Version 2 nests these under timestamps, stages, dataset, completeness and
//! metrics. Unknown v1 fields are kept verbatim under `legacy`.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use statestore::{StoreError, StoreResult, stored_version};
use tracing::debug;

use super::run::{
    CompletenessMetrics, DatasetFingerprint, ExecutionMetrics, RUN_SCHEMA_VERSION, RunOutcome, RunState, RunStatus,
    StageRecord, StageStatus, Timestamps,
};
use crate::gaps::GapRecord;
use crate::retry::{FailureKind, classify};

/// v1 fields with a home in the v2 structure
const V1_FIELDS: &[&str] = &[
    "schema_version",
    "job_id",
    "parent_job_id",
    "created_at",
    "updated_at",
    "completed_at",
    "status",
    "completed_stages",
    "failed_stages",
    "stage_attempts",
    "stage_errors",
    "dataset_hash",
    "dataset_size",
    "completeness_percent",
    "gap_count",
    "gaps",
    "duration_seconds",
    "api_calls",
    "estimated_cost",
    "cache_hits",
    "cache_misses",
];

/// Migrate a stored run document to the current schema
///
/// Already-current documents are returned unchanged, so applying this twice
/// gives the same result as applying it once.
pub fn migrate_run(doc: Value, from: u32) -> StoreResult<Value> {
    debug!(from, "migrate_run: called");
    match from {
        v if v >= RUN_SCHEMA_VERSION => Ok(doc),
        1 => v1_to_v2(doc),
        other => Err(migration_error(other, format!("no migration path from v{}", other))),
    }
}

/// Migrate whatever version the document declares
pub fn migrate_value(doc: Value) -> StoreResult<Value> {
    let from = stored_version(&doc);
    migrate_run(doc, from)
}

fn migration_error(from: u32, message: String) -> StoreError {
    StoreError::Migration {
        collection: "runs",
        from,
        message,
    }
}

fn v1_to_v2(doc: Value) -> StoreResult<Value> {
    let Value::Object(fields) = doc else {
        return Err(migration_error(1, "document is not an object".to_string()));
    };

    let run_id = str_field(&fields, "job_id")
        .ok_or_else(|| migration_error(1, "missing job_id".to_string()))?
        .to_string();

    let epoch = DateTime::<Utc>::UNIX_EPOCH;
    let created_at = time_field(&fields, "created_at").unwrap_or(epoch);
    let timestamps = Timestamps {
        created_at,
        updated_at: time_field(&fields, "updated_at").unwrap_or(created_at),
        completed_at: time_field(&fields, "completed_at"),
    };

    let stages = v1_stages(&fields);
    let status = match str_field(&fields, "status") {
        Some("complete") | Some("completed") => RunStatus::Complete,
        Some("failed") => RunStatus::Failed,
        _ => RunStatus::Running,
    };
    let outcome = if status == RunStatus::Failed {
        stages
            .iter()
            .find(|(_, record)| record.status == StageStatus::Failed)
            .map(|(name, record)| RunOutcome::Failed {
                stage: name.clone(),
                attempts: record.attempts,
                last_error: record.last_error.clone().unwrap_or_default(),
                failure_kind: record.failure_kind.unwrap_or(FailureKind::Unclassified),
            })
    } else {
        None
    };

    let mut legacy: BTreeMap<String, Value> = fields
        .iter()
        .filter(|(key, _)| !V1_FIELDS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    let gaps = match fields.get("gaps") {
        None | Some(Value::Null) => Vec::new(),
        Some(raw) => match serde_json::from_value::<Vec<GapRecord>>(raw.clone()) {
            Ok(gaps) => gaps,
            Err(e) => {
                debug!(error = %e, "v1_to_v2: gaps kept as legacy");
                legacy.insert("gaps".to_string(), raw.clone());
                Vec::new()
            }
        },
    };

    let gap_count = u64_field(&fields, "gap_count").map(|v| v as usize);
    let completeness_percent = f64_field(&fields, "completeness_percent");
    let completeness = if gap_count.is_some() || completeness_percent.is_some() {
        Some(CompletenessMetrics {
            total_sub_requirements: 0,
            gap_count: gap_count.unwrap_or(gaps.len()),
            gap_percent: 0.0,
            average_completeness: completeness_percent.unwrap_or(0.0),
        })
    } else {
        None
    };

    let state = RunState {
        schema_version: RUN_SCHEMA_VERSION,
        run_id,
        parent_run_id: str_field(&fields, "parent_job_id").map(str::to_string),
        timestamps,
        status,
        outcome,
        dataset_dir: None,
        iteration: 0,
        stages,
        dataset: DatasetFingerprint {
            hash: str_field(&fields, "dataset_hash").unwrap_or_default().to_string(),
            size_bytes: u64_field(&fields, "dataset_size").unwrap_or(0),
            item_count: 0,
            items: BTreeMap::new(),
        },
        completeness,
        gaps,
        relevance: None,
        metrics: ExecutionMetrics {
            duration_ms: f64_field(&fields, "duration_seconds")
                .map(|secs| (secs * 1000.0).round().max(0.0) as u64)
                .unwrap_or(0),
            external_calls: u64_field(&fields, "api_calls").unwrap_or(0),
            estimated_cost: f64_field(&fields, "estimated_cost").unwrap_or(0.0),
            cache_hits: u64_field(&fields, "cache_hits").unwrap_or(0),
            cache_misses: u64_field(&fields, "cache_misses").unwrap_or(0),
        },
        iterations: Vec::new(),
        legacy,
    };

    serde_json::to_value(&state).map_err(StoreError::Serialize)
}

/// Rebuild per-stage records from the flat v1 lists and maps
fn v1_stages(fields: &Map<String, Value>) -> BTreeMap<String, StageRecord> {
    let mut stages: BTreeMap<String, StageRecord> = BTreeMap::new();

    let attempts: BTreeMap<String, u32> = fields
        .get("stage_attempts")
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_u64().map(|n| (k.clone(), u32::try_from(n).unwrap_or(u32::MAX))))
                .collect()
        })
        .unwrap_or_default();
    let errors: BTreeMap<String, String> = fields
        .get("stage_errors")
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();

    for (name, count) in &attempts {
        let record = stages.entry(name.clone()).or_default();
        record.attempts = *count;
        if *count > 0 {
            record.status = StageStatus::Retrying;
        }
    }
    for (name, error) in &errors {
        let record = stages.entry(name.clone()).or_default();
        record.last_error = Some(error.clone());
        record.failure_kind = Some(classify(error).kind);
    }
    for name in string_list(fields, "completed_stages") {
        let record = stages.entry(name).or_default();
        record.status = StageStatus::Complete;
        record.attempts = record.attempts.max(1);
    }
    for name in string_list(fields, "failed_stages") {
        let record = stages.entry(name).or_default();
        record.status = StageStatus::Failed;
        record.attempts = record.attempts.max(1);
    }

    stages
}

fn str_field<'a>(fields: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    fields.get(key).and_then(Value::as_str)
}

fn u64_field(fields: &Map<String, Value>, key: &str) -> Option<u64> {
    let value = fields.get(key)?;
    value
        .as_u64()
        .or_else(|| value.as_f64().filter(|f| *f >= 0.0).map(|f| f.round() as u64))
}

fn f64_field(fields: &Map<String, Value>, key: &str) -> Option<f64> {
    fields.get(key).and_then(Value::as_f64)
}

fn string_list(fields: &Map<String, Value>, key: &str) -> Vec<String> {
    fields
        .get(key)
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}

/// Timestamps were written as RFC 3339 strings or as Unix seconds
fn time_field(fields: &Map<String, Value>, key: &str) -> Option<DateTime<Utc>> {
    match fields.get(key)? {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .or_else(|_| {
                chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").map(|naive| naive.and_utc())
            })
            .ok(),
        Value::Number(n) => {
            let secs = n.as_f64()?;
            let millis = (secs * 1000.0).round() as i64;
            Utc.timestamp_millis_opt(millis).single()
        }
        _ => None,
    }
}
