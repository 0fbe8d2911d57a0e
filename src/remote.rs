//! # Remote Payloads: Tolerant Decoding of Cluster Responses
//!
//! Execution clusters return loosely typed JSON: the same field may arrive
//! as `podStartedAt` or `pod_started_at`, counters may be numbers or numeric
//! strings, and timestamps may carry an explicit offset or none at all. This
//! module turns those payloads into typed structs at the ingestion boundary so
//! nothing downstream handles `serde_json::Value` maps.
//!
//! ## Timestamp formats
//!
//! 1. RFC 3339 (`2024-05-01T10:00:00Z`, `2024-05-01T10:00:00.5+08:00`)
//! 2. Naive `YYYY-MM-DDTHH:MM:SS[.fff]` (or with a space separator), read as UTC
//! 3. Integer unix epoch, seconds or milliseconds
//!
//! The zero time some cluster runtimes emit for unset fields
//! (`0001-01-01T00:00:00Z`) decodes as absent.

use chrono::{DateTime, Datelike, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};

use crate::db::WORKER_STATUS_OFFLINE;

/// One worker entry from a cluster's worker listing or worker detail.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteWorker {
    pub id: String,
    pub status: Option<String>,
    pub pod_name: Option<String>,
    pub pod_created_at: Option<DateTime<Utc>>,
    pub pod_started_at: Option<DateTime<Utc>>,
    pub pod_ready_at: Option<DateTime<Utc>>,
    pub terminated_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_task_time: Option<DateTime<Utc>>,
    pub cold_start_duration_ms: Option<i64>,
    pub current_jobs: i32,
    pub total_tasks_completed: i64,
    pub total_tasks_failed: i64,
}

impl RemoteWorker {
    /// Decode a worker object. Returns `None` when the payload is not an
    /// object or carries no usable worker id.
    pub fn decode(value: &Value) -> Option<Self> {
        let obj = unwrap_envelope(value)?;
        let id = string_field(obj, &["id", "worker_id"])?;
        Some(RemoteWorker {
            id,
            status: string_field(obj, &["status"]),
            pod_name: string_field(obj, &["pod_name"]),
            pod_created_at: time_field(obj, &["pod_created_at"]),
            pod_started_at: time_field(obj, &["pod_started_at"]),
            pod_ready_at: time_field(obj, &["pod_ready_at"]),
            terminated_at: time_field(obj, &["terminated_at", "pod_terminated_at"]),
            last_heartbeat: time_field(obj, &["last_heartbeat"]),
            last_task_time: time_field(obj, &["last_task_time"]),
            cold_start_duration_ms: int_field(obj, &["cold_start_duration_ms"]),
            current_jobs: int_field(obj, &["current_jobs"])
                .and_then(|v| i32::try_from(v).ok())
                .unwrap_or(0),
            total_tasks_completed: int_field(obj, &["total_tasks_completed"]).unwrap_or(0),
            total_tasks_failed: int_field(obj, &["total_tasks_failed"]).unwrap_or(0),
        })
    }

    pub fn is_offline(&self) -> bool {
        self.status
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case(WORKER_STATUS_OFFLINE))
    }

    /// Best available termination estimate from the remote side alone.
    pub fn termination_estimate(&self) -> Option<DateTime<Utc>> {
        self.terminated_at.or(self.last_heartbeat)
    }
}

/// Decode every worker in a listing, skipping entries without an id.
/// Accepts a bare array or an object wrapping one under `workers`/`data`/`items`.
pub fn decode_worker_list(value: &Value) -> Vec<RemoteWorker> {
    list_items(value)
        .iter()
        .filter_map(RemoteWorker::decode)
        .collect()
}

/// Deployment state from a cluster's endpoint detail.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteEndpointState {
    pub status: Option<String>,
    pub replicas: Option<i32>,
    pub ready_replicas: Option<i32>,
    pub image: Option<String>,
}

impl RemoteEndpointState {
    pub fn decode(value: &Value) -> Self {
        let Some(obj) = unwrap_envelope(value) else {
            return Self::default();
        };
        RemoteEndpointState {
            status: string_field(obj, &["status"]),
            replicas: int_field(obj, &["replicas"]).and_then(|v| i32::try_from(v).ok()),
            ready_replicas: int_field(obj, &["ready_replicas"]).and_then(|v| i32::try_from(v).ok()),
            image: string_field(obj, &["image"]),
        }
    }

    pub fn is_running(&self) -> bool {
        self.status
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case("running"))
    }
}

// ── Field access ────────────────────────────────────────────────

/// Some clusters wrap single objects as `{"data": {...}}`.
fn unwrap_envelope(value: &Value) -> Option<&Map<String, Value>> {
    let obj = value.as_object()?;
    match obj.get("data") {
        Some(Value::Object(inner)) if !obj.contains_key("id") => Some(inner),
        _ => Some(obj),
    }
}

fn list_items(value: &Value) -> &[Value] {
    match value {
        Value::Array(items) => items,
        Value::Object(obj) => ["workers", "data", "items"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_array))
            .map(Vec::as_slice)
            .unwrap_or(&[]),
        _ => &[],
    }
}

/// Look a field up under each candidate name, in snake_case and camelCase.
/// Explicit nulls count as absent.
fn lookup<'a>(obj: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|name| {
        obj.get(*name)
            .or_else(|| obj.get(&snake_to_camel(name)))
            .filter(|v| !v.is_null())
    })
}

fn snake_to_camel(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = false;
    for c in name.chars() {
        if c == '_' {
            upper = true;
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

fn string_field(obj: &Map<String, Value>, names: &[&str]) -> Option<String> {
    match lookup(obj, names)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn int_field(obj: &Map<String, Value>, names: &[&str]) -> Option<i64> {
    coerce_i64(lookup(obj, names)?)
}

fn time_field(obj: &Map<String, Value>, names: &[&str]) -> Option<DateTime<Utc>> {
    parse_timestamp(lookup(obj, names)?)
}

/// Integer from a JSON number (fractions truncated) or a numeric string.
pub fn coerce_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f as i64))
        }
        Value::Bool(_) | Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let parsed = match value {
        Value::String(s) => parse_time_str(s.trim()),
        Value::Number(n) => n.as_i64().and_then(from_epoch),
        _ => None,
    }?;
    // Zero-value timestamps mean "unset".
    (parsed.year() > 1).then_some(parsed)
}

fn parse_time_str(s: &str) -> Option<DateTime<Utc>> {
    if s.is_empty() {
        return None;
    }
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    s.parse::<i64>().ok().and_then(from_epoch)
}

fn from_epoch(n: i64) -> Option<DateTime<Utc>> {
    if n <= 0 {
        return None;
    }
    if n >= 100_000_000_000 {
        DateTime::from_timestamp_millis(n)
    } else {
        DateTime::from_timestamp(n, 0)
    }
}
