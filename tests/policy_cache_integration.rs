mod common;

use std::sync::Arc;

use serde_json::json;

use common::{cache_with, ready_policy};
use kube_activity::cache::PolicyCache;
use kube_activity::crd::PolicyRule;
use kube_activity::policy::PolicyError;
use kube_activity::resolve::StaticKindResolver;

fn create_audit() -> serde_json::Value {
    json!({
        "verb": "create",
        "objectRef": {"apiGroup": "apps", "resource": "deployments", "name": "web"}
    })
}

#[test]
fn lifecycle_add_update_remove() {
    let cache = cache_with(vec![ready_policy(
        "p",
        "apps",
        "Deployment",
        vec![(r#"audit.verb == "create""#, r#""v1""#)],
        vec![],
    )]);
    assert_eq!(cache.len(), 1);

    let matched = cache
        .match_audit("apps", "deployments", &create_audit())
        .expect("no evaluation error")
        .expect("should match");
    assert_eq!(matched.summary, "v1");

    // update replaces the compiled entry in one step
    let updated = ready_policy(
        "p",
        "apps",
        "Deployment",
        vec![(r#"audit.verb == "create""#, r#""v2""#)],
        vec![],
    );
    cache.apply(&updated).expect("should install");
    assert_eq!(cache.len(), 1);
    let matched = cache
        .match_audit("apps", "deployments", &create_audit())
        .expect("no evaluation error")
        .expect("should match");
    assert_eq!(matched.summary, "v2");

    cache.remove(&updated);
    assert!(cache.is_empty());
}

#[test]
fn readiness_gate_is_the_only_admission_path() {
    let cache = PolicyCache::new(Arc::new(StaticKindResolver::builtin()));

    // not ready: never installed
    let mut policy = ready_policy(
        "p",
        "apps",
        "Deployment",
        vec![(r#"true"#, r#""s""#)],
        vec![],
    );
    policy.status = None;
    assert!(!cache.apply(&policy).expect("apply should not error"));
    assert!(cache.is_empty());

    // readiness arrives: installed
    let policy = ready_policy(
        "p",
        "apps",
        "Deployment",
        vec![(r#"true"#, r#""s""#)],
        vec![],
    );
    assert!(cache.apply(&policy).expect("apply should not error"));
    assert_eq!(cache.len(), 1);

    // readiness revoked: removed again
    let mut revoked = policy.clone();
    revoked.status = None;
    assert!(!cache.apply(&revoked).expect("apply should not error"));
    assert!(cache.is_empty());
}

#[test]
fn compile_failure_removes_rather_than_degrades() {
    let cache = cache_with(vec![ready_policy(
        "p",
        "apps",
        "Deployment",
        vec![(r#"true"#, r#""old""#)],
        vec![],
    )]);

    let mut broken = ready_policy(
        "p",
        "apps",
        "Deployment",
        vec![(r#"true"#, r#""new""#)],
        vec![],
    );
    broken.spec.audit_rules.push(PolicyRule {
        match_expression: "((".to_string(),
        summary: r#""x""#.to_string(),
    });

    let err = cache.apply(&broken).expect_err("compile should fail");
    assert!(matches!(err, PolicyError::Compile { .. }));

    // neither the old nor a half-compiled new entry remains
    assert!(cache.is_empty());
    assert!(
        cache
            .match_audit("apps", "deployments", &create_audit())
            .expect("no evaluation error")
            .is_none()
    );
}

#[test]
fn rules_evaluate_in_declared_order() {
    let cache = cache_with(vec![ready_policy(
        "p",
        "apps",
        "Deployment",
        vec![
            (r#"audit.verb == "delete""#, r#""deleted""#),
            (r#"audit.verb == "create""#, r#""created""#),
            (r#"true"#, r#""fallback""#),
        ],
        vec![],
    )]);

    let matched = cache
        .match_audit("apps", "deployments", &create_audit())
        .expect("no evaluation error")
        .expect("should match");
    // the second rule wins; the catch-all never runs
    assert_eq!(matched.summary, "created");
}

#[test]
fn audit_and_event_rule_sets_are_independent() {
    let cache = cache_with(vec![ready_policy(
        "p",
        "",
        "Pod",
        vec![(r#"audit.verb == "create""#, r#""audit side""#)],
        vec![(r#"event.reason == "Scheduled""#, r#""event side""#)],
    )]);

    let audit = json!({
        "verb": "create",
        "objectRef": {"apiGroup": "", "resource": "pods", "name": "p"}
    });
    let matched = cache
        .match_audit("", "pods", &audit)
        .expect("no evaluation error")
        .expect("should match");
    assert_eq!(matched.summary, "audit side");

    let event = json!({"reason": "Scheduled", "regarding": {"kind": "Pod", "name": "p"}});
    let matched = cache
        .match_event("", "Pod", &event)
        .expect("no evaluation error")
        .expect("should match");
    assert_eq!(matched.summary, "event side");
}

#[test]
fn resync_drops_stale_policies_and_applies_gate() {
    let cache = cache_with(vec![ready_policy(
        "stale",
        "apps",
        "StatefulSet",
        vec![(r#"true"#, r#""s""#)],
        vec![],
    )]);

    let mut not_ready = ready_policy(
        "gated",
        "batch",
        "Job",
        vec![(r#"true"#, r#""s""#)],
        vec![],
    );
    not_ready.status = None;

    cache.resync(&[
        ready_policy("a", "apps", "Deployment", vec![(r#"true"#, r#""s""#)], vec![]),
        not_ready,
    ]);

    assert_eq!(cache.len(), 1);
    let audit = json!({"verb": "create", "objectRef": {"resource": "statefulsets", "apiGroup": "apps"}});
    assert!(
        cache
            .match_audit("apps", "statefulsets", &audit)
            .expect("no evaluation error")
            .is_none()
    );
}

#[test]
fn concurrent_readers_see_whole_snapshots() {
    let cache = Arc::new(cache_with(vec![ready_policy(
        "p",
        "apps",
        "Deployment",
        vec![(r#"true"#, r#""s""#)],
        vec![],
    )]));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let cache = cache.clone();
        handles.push(std::thread::spawn(move || {
            for _ in 0..200 {
                // a reader always observes either a full entry or none
                let result = cache.match_audit("apps", "deployments", &create_audit());
                assert!(result.is_ok());
            }
        }));
    }

    // writer churns the same key while readers run
    for i in 0..100 {
        let summary = format!(r#""gen {i}""#);
        let policy = ready_policy(
            "p",
            "apps",
            "Deployment",
            vec![(r#"true"#, summary.as_str())],
            vec![],
        );
        cache.apply(&policy).expect("should install");
    }

    for handle in handles {
        handle.join().expect("reader thread should not panic");
    }
}
