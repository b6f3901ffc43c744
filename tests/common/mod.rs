#![allow(dead_code)]

use std::sync::Arc;

use serde_json::{Value, json};

use kube_activity::cache::PolicyCache;
use kube_activity::crd::{
    ActivityPolicy, ActivityPolicySpec, ActivityPolicyStatus, CONDITION_READY, Condition,
    PolicyResource, PolicyRule,
};
use kube_activity::resolve::StaticKindResolver;

/// A policy with a Ready=True condition, as the readiness controller would
/// leave it.
pub fn ready_policy(
    name: &str,
    api_group: &str,
    kind: &str,
    audit_rules: Vec<(&str, &str)>,
    event_rules: Vec<(&str, &str)>,
) -> ActivityPolicy {
    let mut policy = ActivityPolicy::new(
        name,
        ActivityPolicySpec {
            resource: PolicyResource {
                api_group: api_group.to_string(),
                kind: kind.to_string(),
            },
            audit_rules: rules(audit_rules),
            event_rules: rules(event_rules),
        },
    );
    policy.status = Some(ActivityPolicyStatus {
        observed_generation: Some(1),
        conditions: vec![Condition::new(CONDITION_READY, true, "ExpressionsValid", "")],
    });
    policy
}

fn rules(pairs: Vec<(&str, &str)>) -> Vec<PolicyRule> {
    pairs
        .into_iter()
        .map(|(m, s)| PolicyRule {
            match_expression: m.to_string(),
            summary: s.to_string(),
        })
        .collect()
}

/// Cache over the built-in kind table with the given policies installed.
pub fn cache_with(policies: Vec<ActivityPolicy>) -> PolicyCache {
    let cache = PolicyCache::new(Arc::new(StaticKindResolver::builtin()));
    for policy in &policies {
        cache.apply(policy).expect("policy should install");
    }
    cache
}

/// A create-Deployment audit record in the shape the API server emits.
pub fn make_audit(audit_id: &str, username: &str, verb: &str) -> Value {
    json!({
        "auditID": audit_id,
        "verb": verb,
        "user": {"username": username, "uid": "u1"},
        "objectRef": {
            "apiGroup": "apps",
            "apiVersion": "apps/v1",
            "resource": "deployments",
            "namespace": "staging",
            "name": "my-deploy"
        },
        "requestReceivedTimestamp": "2026-02-27T10:00:00Z"
    })
}

/// A scheduler Event carrying only the legacy `involvedObject` reference.
pub fn make_event(uid: &str, reason: &str) -> Value {
    json!({
        "metadata": {"uid": uid, "creationTimestamp": "2024-01-15T10:30:00Z"},
        "reason": reason,
        "message": "Successfully assigned default/my-pod to node-1",
        "reportingController": "default-scheduler",
        "involvedObject": {
            "kind": "Pod",
            "apiVersion": "v1",
            "name": "my-pod",
            "namespace": "default",
            "uid": "pod-456"
        }
    })
}
