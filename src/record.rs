//! Accessors over free-form source records.
//!
//! Audit records and Kubernetes Events arrive as untyped JSON maps; strong
//! typing is deferred to the expression evaluator and the activity builder.
//! This module is the small accessor set they share.

use chrono::{DateTime, Utc};
use serde_json::Value;

/* ============================= MAP ACCESS ============================= */

/// Walk a nested path of object keys, returning the value if every hop exists.
pub fn value_at<'a>(record: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut current = record;
    for key in path {
        current = current.as_object()?.get(*key)?;
    }
    Some(current)
}

/// Nested string lookup; absent or non-string yields `None`.
pub fn str_at<'a>(record: &'a Value, path: &[&str]) -> Option<&'a str> {
    value_at(record, path).and_then(Value::as_str)
}

/// Nested string lookup with an empty-string default.
pub fn str_at_or_empty<'a>(record: &'a Value, path: &[&str]) -> &'a str {
    str_at(record, path).unwrap_or("")
}

/* ============================= EVENT NORMALIZATION ============================= */

/// Ensure `regarding` is populated on an Event record.
///
/// Older clients populate `involvedObject` instead; downstream evaluators
/// only ever read `regarding`.
pub fn normalize_event(event: &mut Value) {
    let needs_copy = match event.get("regarding") {
        None | Some(Value::Null) => true,
        Some(v) => v.as_object().map(|o| o.is_empty()).unwrap_or(false),
    };
    if !needs_copy {
        return;
    }
    let involved = match event.get("involvedObject") {
        Some(v) if !v.is_null() => v.clone(),
        _ => return,
    };
    if let Some(obj) = event.as_object_mut() {
        obj.insert("regarding".to_string(), involved);
    }
}

/* ============================= RESOURCE LOCATION ============================= */

/// `(apiGroup, resource)` from an audit record's `objectRef`.
///
/// The resource is the plural form the API server logs. `None` when the
/// record carries no object reference (e.g. non-resource URLs).
pub fn audit_resource(audit: &Value) -> Option<(String, String)> {
    let resource = str_at(audit, &["objectRef", "resource"])?;
    if resource.is_empty() {
        return None;
    }
    let group = str_at_or_empty(audit, &["objectRef", "apiGroup"]);
    Some((group.to_string(), resource.to_string()))
}

/// `(apiGroup, kind)` from a normalized event's `regarding`.
///
/// The group is derived from `regarding.apiVersion` ("apps/v1" → "apps",
/// "v1" → core/empty).
pub fn event_resource(event: &Value) -> Option<(String, String)> {
    let kind = str_at(event, &["regarding", "kind"])?;
    if kind.is_empty() {
        return None;
    }
    let api_version = str_at_or_empty(event, &["regarding", "apiVersion"]);
    Some((api_group_of(api_version).to_string(), kind.to_string()))
}

/// Group component of an apiVersion string; the core group is empty.
pub fn api_group_of(api_version: &str) -> &str {
    match api_version.rsplit_once('/') {
        Some((group, _)) => group,
        None => "",
    }
}

/* ============================= TIMESTAMPS ============================= */

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn timestamp_at(record: &Value, path: &[&str]) -> Option<DateTime<Utc>> {
    str_at(record, path).and_then(parse_timestamp)
}

/// Audit timestamp precedence: `requestReceivedTimestamp`, then
/// `stageTimestamp`. `None` means the caller substitutes process time.
pub fn audit_timestamp(audit: &Value) -> Option<DateTime<Utc>> {
    timestamp_at(audit, &["requestReceivedTimestamp"])
        .or_else(|| timestamp_at(audit, &["stageTimestamp"]))
}

/// Event timestamp precedence: `eventTime`, `lastTimestamp`,
/// `firstTimestamp`, `metadata.creationTimestamp`.
pub fn event_timestamp(event: &Value) -> Option<DateTime<Utc>> {
    timestamp_at(event, &["eventTime"])
        .or_else(|| timestamp_at(event, &["lastTimestamp"]))
        .or_else(|| timestamp_at(event, &["firstTimestamp"]))
        .or_else(|| timestamp_at(event, &["metadata", "creationTimestamp"]))
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_str_at_nested() {
        let record = json!({"user": {"username": "alice", "uid": "u1"}});
        assert_eq!(str_at(&record, &["user", "username"]), Some("alice"));
        assert_eq!(str_at(&record, &["user", "missing"]), None);
        assert_eq!(str_at(&record, &["missing", "username"]), None);
    }

    #[test]
    fn test_str_at_non_string_is_none() {
        let record = json!({"count": 3, "nested": {"flag": true}});
        assert_eq!(str_at(&record, &["count"]), None);
        assert_eq!(str_at(&record, &["nested", "flag"]), None);
    }

    #[test]
    fn test_str_at_or_empty() {
        let record = json!({"a": "x"});
        assert_eq!(str_at_or_empty(&record, &["a"]), "x");
        assert_eq!(str_at_or_empty(&record, &["b"]), "");
    }

    #[test]
    fn test_value_at_root() {
        let record = json!({"objectRef": {"name": "web"}});
        assert!(value_at(&record, &[]).is_some());
        assert!(value_at(&record, &["objectRef"]).unwrap().is_object());
    }

    #[test]
    fn test_normalize_event_copies_involved_object() {
        let mut event = json!({
            "metadata": {"uid": "event-123"},
            "involvedObject": {"kind": "Pod", "name": "my-pod", "namespace": "default"}
        });
        normalize_event(&mut event);

        assert_eq!(str_at(&event, &["regarding", "kind"]), Some("Pod"));
        assert_eq!(str_at(&event, &["regarding", "name"]), Some("my-pod"));
        // involvedObject stays for consumers that still read it
        assert_eq!(str_at(&event, &["involvedObject", "kind"]), Some("Pod"));
    }

    #[test]
    fn test_normalize_event_keeps_existing_regarding() {
        let mut event = json!({
            "regarding": {"kind": "Deployment", "name": "web"},
            "involvedObject": {"kind": "Pod", "name": "other"}
        });
        normalize_event(&mut event);
        assert_eq!(str_at(&event, &["regarding", "kind"]), Some("Deployment"));
    }

    #[test]
    fn test_normalize_event_fills_empty_regarding() {
        let mut event = json!({
            "regarding": {},
            "involvedObject": {"kind": "Pod", "name": "p"}
        });
        normalize_event(&mut event);
        assert_eq!(str_at(&event, &["regarding", "kind"]), Some("Pod"));
    }

    #[test]
    fn test_normalize_event_without_either_is_noop() {
        let mut event = json!({"reason": "Scheduled"});
        normalize_event(&mut event);
        assert!(event.get("regarding").is_none());
    }

    #[test]
    fn test_audit_resource() {
        let audit = json!({
            "objectRef": {"apiGroup": "apps", "resource": "deployments", "name": "web"}
        });
        assert_eq!(
            audit_resource(&audit),
            Some(("apps".to_string(), "deployments".to_string()))
        );
    }

    #[test]
    fn test_audit_resource_core_group() {
        let audit = json!({"objectRef": {"resource": "pods", "name": "p"}});
        assert_eq!(
            audit_resource(&audit),
            Some((String::new(), "pods".to_string()))
        );
    }

    #[test]
    fn test_audit_resource_absent() {
        assert_eq!(audit_resource(&json!({"verb": "get"})), None);
        assert_eq!(audit_resource(&json!({"objectRef": {"resource": ""}})), None);
    }

    #[test]
    fn test_event_resource_grouped() {
        let mut event = json!({
            "involvedObject": {"kind": "Deployment", "apiVersion": "apps/v1", "name": "web"}
        });
        normalize_event(&mut event);
        assert_eq!(
            event_resource(&event),
            Some(("apps".to_string(), "Deployment".to_string()))
        );
    }

    #[test]
    fn test_event_resource_core() {
        let event = json!({"regarding": {"kind": "Pod", "apiVersion": "v1"}});
        assert_eq!(
            event_resource(&event),
            Some((String::new(), "Pod".to_string()))
        );
    }

    #[test]
    fn test_api_group_of() {
        assert_eq!(api_group_of("apps/v1"), "apps");
        assert_eq!(api_group_of("v1"), "");
        assert_eq!(api_group_of("networking.k8s.io/v1"), "networking.k8s.io");
        assert_eq!(api_group_of(""), "");
    }

    #[test]
    fn test_audit_timestamp_precedence() {
        let audit = json!({
            "requestReceivedTimestamp": "2026-02-27T10:00:00Z",
            "stageTimestamp": "2026-02-27T10:00:05Z"
        });
        let ts = audit_timestamp(&audit).expect("timestamp should parse");
        assert_eq!(ts.to_rfc3339(), "2026-02-27T10:00:00+00:00");
    }

    #[test]
    fn test_audit_timestamp_falls_back_to_stage() {
        let audit = json!({"stageTimestamp": "2026-02-27T10:00:05Z"});
        let ts = audit_timestamp(&audit).expect("timestamp should parse");
        assert_eq!(ts.to_rfc3339(), "2026-02-27T10:00:05+00:00");
    }

    #[test]
    fn test_audit_timestamp_absent() {
        assert!(audit_timestamp(&json!({})).is_none());
        assert!(audit_timestamp(&json!({"requestReceivedTimestamp": "garbage"})).is_none());
    }

    #[test]
    fn test_event_timestamp_precedence_chain() {
        let event = json!({
            "eventTime": "2024-01-15T10:30:00.123456Z",
            "lastTimestamp": "2024-01-15T11:00:00Z"
        });
        let ts = event_timestamp(&event).expect("timestamp should parse");
        assert_eq!(ts.timestamp(), 1705314600);

        let event = json!({
            "lastTimestamp": "2024-01-15T11:00:00Z",
            "firstTimestamp": "2024-01-15T09:00:00Z"
        });
        let ts = event_timestamp(&event).expect("timestamp should parse");
        assert_eq!(ts.to_rfc3339(), "2024-01-15T11:00:00+00:00");

        let event = json!({"metadata": {"creationTimestamp": "2024-01-15T10:30:00Z"}});
        assert!(event_timestamp(&event).is_some());

        assert!(event_timestamp(&json!({})).is_none());
    }

    #[test]
    fn test_event_time_accepts_nano_precision() {
        let event = json!({"eventTime": "2024-01-15T10:30:00.123456789Z"});
        assert!(event_timestamp(&event).is_some());
    }
}
