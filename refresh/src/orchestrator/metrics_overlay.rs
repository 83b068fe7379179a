//! Metrics-only overlay merge logic (§4.2).
//!
//! A few domains (`pods`, `namespace-workloads`, `nodes`) stream their primary data and only poll
//! snapshots for usage metrics. Applying such a snapshot must not replace rows the stream already
//! owns: only the usage fields on matching rows are copied over.

use serde_json::{Map, Value};

/// The domains that declare `streaming.metrics_only = true` and need one of the natural-key
/// functions below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricsDomain {
    /// `clusterId::namespace::name`
    Pods,
    /// `clusterId::namespace::kind::name`
    Workloads,
    /// `clusterId::name`
    Nodes,
}

/// Fields copied from an incoming metrics entry onto a matching existing row. Everything else on
/// the existing row (status, readiness, desired/actual counts) is left untouched.
const USAGE_FIELDS: &[&str] = &["cpuUsage", "memUsage", "memoryUsage", "podMetrics"];

/// The natural key identifying one entry within a domain's row set, used to match incoming
/// metrics-only rows against existing ones.
pub fn natural_key(domain: MetricsDomain, row: &Value) -> Option<String> {
    let obj = row.as_object()?;
    let cluster_id = str_field(obj, "clusterId")?;
    match domain {
        MetricsDomain::Pods => {
            let namespace = str_field(obj, "namespace")?;
            let name = str_field(obj, "name")?;
            Some(format!("{cluster_id}::{namespace}::{name}"))
        }
        MetricsDomain::Workloads => {
            let namespace = str_field(obj, "namespace")?;
            let kind = str_field(obj, "kind")?;
            let name = str_field(obj, "name")?;
            Some(format!("{cluster_id}::{namespace}::{kind}::{name}"))
        }
        MetricsDomain::Nodes => {
            let name = str_field(obj, "name")?;
            Some(format!("{cluster_id}::{name}"))
        }
    }
}

fn str_field<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str)
}

/// Merge `incoming` metrics-only rows into `existing` rows (both arrays under the domain's usual
/// `payload` shape), matching by natural key. Rows present only in `existing` are untouched; rows
/// present only in `incoming` are NOT introduced. Returns the merged array; `existing` is not
/// mutated in place (the reactive store's no-in-place-mutation invariant).
pub fn merge_usage_fields(domain: MetricsDomain, existing: &[Value], incoming: &[Value]) -> Vec<Value> {
    let mut incoming_by_key = std::collections::HashMap::new();
    for row in incoming {
        if let Some(key) = natural_key(domain, row) {
            incoming_by_key.insert(key, row);
        }
    }

    existing
        .iter()
        .map(|row| match natural_key(domain, row) {
            Some(key) => match incoming_by_key.get(&key) {
                Some(update) => apply_usage_fields(row, update),
                None => row.clone(),
            },
            None => row.clone(),
        })
        .collect()
}

fn apply_usage_fields(existing: &Value, update: &Value) -> Value {
    let Some(update_obj) = update.as_object() else {
        return existing.clone();
    };
    let mut merged = existing.clone();
    let Some(merged_obj) = merged.as_object_mut() else {
        return existing.clone();
    };
    for field in USAGE_FIELDS {
        if let Some(value) = update_obj.get(*field) {
            merged_obj.insert((*field).to_string(), value.clone());
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn natural_key_for_pods() {
        let row = json!({"clusterId": "c1", "namespace": "ns", "name": "web-0"});
        assert_eq!(
            natural_key(MetricsDomain::Pods, &row).as_deref(),
            Some("c1::ns::web-0")
        );
    }

    #[test]
    fn merge_updates_only_matching_rows_and_only_usage_fields() {
        let existing = vec![
            json!({"clusterId": "c1", "namespace": "ns", "name": "a", "status": "Running", "cpuUsage": 1}),
            json!({"clusterId": "c1", "namespace": "ns", "name": "b", "status": "Running", "cpuUsage": 2}),
            json!({"clusterId": "c1", "namespace": "ns", "name": "c", "status": "Pending", "cpuUsage": 3}),
        ];
        let incoming = vec![
            json!({"clusterId": "c1", "namespace": "ns", "name": "a", "cpuUsage": 10, "memUsage": 20}),
            json!({"clusterId": "c1", "namespace": "ns", "name": "b", "cpuUsage": 11}),
            json!({"clusterId": "c1", "namespace": "ns", "name": "nonexistent", "cpuUsage": 99}),
        ];
        let merged = merge_usage_fields(MetricsDomain::Pods, &existing, &incoming);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0]["cpuUsage"], 10);
        assert_eq!(merged[0]["memUsage"], 20);
        assert_eq!(merged[0]["status"], "Running");
        assert_eq!(merged[1]["cpuUsage"], 11);
        assert_eq!(merged[2]["cpuUsage"], 3);
        assert_eq!(merged[2]["status"], "Pending");
    }
}
