mod common;

use chrono::Utc;

use common::{cache_with, make_audit, make_event, ready_policy};
use kube_activity::activity::{
    ActorType, ChangeSource, OriginType, TenantType, build_activity_subject,
};
use kube_activity::consumer::{Outcome, SkipReason, process_audit, process_event};
use kube_activity::dlq::{DlqErrorType, dead_letter_subject};
use kube_activity::record::{normalize_event, str_at};

fn deployment_create_policy() -> kube_activity::crd::ActivityPolicy {
    ready_policy(
        "deployment-activity",
        "apps",
        "Deployment",
        vec![(
            r#"audit.verb == "create""#,
            r#""Deployment " + audit.objectRef.name + " was created""#,
        )],
        vec![],
    )
}

fn pod_scheduled_policy() -> kube_activity::crd::ActivityPolicy {
    ready_policy(
        "pod-events",
        "",
        "Pod",
        vec![],
        vec![(
            r#"event.reason == "Scheduled""#,
            r#""Pod " + event.regarding.name + " was scheduled""#,
        )],
    )
}

// ── scenario: audit → activity happy path ──

#[test]
fn audit_happy_path_produces_canonical_activity() {
    let cache = cache_with(vec![deployment_create_policy()]);
    let audit = make_audit("abcdef1234567890", "alice@example.com", "create");
    let payload = serde_json::to_vec(&audit).unwrap();

    let Outcome::Publish(activity) = process_audit(&payload, &cache, Utc::now()) else {
        panic!("expected an activity");
    };

    assert_eq!(activity.metadata.name, "act-abcdef12");
    assert_eq!(activity.spec.actor.actor_type, ActorType::User);
    assert_eq!(activity.spec.actor.name, "alice@example.com");
    assert_eq!(activity.spec.actor.email.as_deref(), Some("alice@example.com"));
    assert_eq!(activity.spec.actor.uid, "u1");
    assert_eq!(activity.spec.change_source, ChangeSource::Human);
    assert_eq!(activity.spec.resource.api_group, "apps");
    assert_eq!(activity.spec.resource.kind, "Deployment");
    assert_eq!(activity.spec.resource.namespace.as_deref(), Some("staging"));
    assert_eq!(activity.spec.resource.name, "my-deploy");
    assert_eq!(activity.spec.summary, "Deployment my-deploy was created");
    assert_eq!(activity.spec.origin.origin_type, OriginType::Audit);
    assert_eq!(activity.spec.origin.id, "abcdef1234567890");
    assert_eq!(
        build_activity_subject("activities", &activity),
        "activities.platform._.apps.audit.Deployment.staging.act-abcdef12"
    );
}

// ── scenario: system audit ──

#[test]
fn system_audit_classified_as_system_change() {
    let cache = cache_with(vec![deployment_create_policy()]);
    let audit = make_audit(
        "abcdef1234567890",
        "system:controller:replicaset-controller",
        "create",
    );
    let payload = serde_json::to_vec(&audit).unwrap();

    let Outcome::Publish(activity) = process_audit(&payload, &cache, Utc::now()) else {
        panic!("expected an activity");
    };

    assert_eq!(activity.spec.change_source, ChangeSource::System);
    assert_eq!(activity.spec.actor.actor_type, ActorType::System);
    assert_eq!(activity.spec.actor.name, "controller:replicaset-controller");
}

// ── scenario: empty auditID ──

#[test]
fn missing_audit_id_falls_back_to_random_name() {
    let cache = cache_with(vec![deployment_create_policy()]);
    let mut audit = make_audit("ignored", "alice@example.com", "create");
    audit.as_object_mut().unwrap().remove("auditID");
    audit["objectRef"].as_object_mut().unwrap().remove("namespace");
    let payload = serde_json::to_vec(&audit).unwrap();

    let Outcome::Publish(activity) = process_audit(&payload, &cache, Utc::now()) else {
        panic!("expected an activity");
    };

    assert!(activity.metadata.name.starts_with("act-"));
    assert_eq!(activity.metadata.name.len(), 12);
    assert_eq!(activity.spec.origin.id, "");
    // missing namespace renders as the `_` sentinel
    let subject = build_activity_subject("activities", &activity);
    assert!(subject.contains(".Deployment._."));
}

// ── scenario: event with involvedObject only ──

#[test]
fn event_with_involved_object_normalizes_and_matches() {
    let cache = cache_with(vec![pod_scheduled_policy()]);
    let event = make_event("event-123", "Scheduled");
    let payload = serde_json::to_vec(&event).unwrap();

    let Outcome::Publish(activity) = process_event(&payload, &cache, Utc::now()) else {
        panic!("expected an activity");
    };

    assert_eq!(activity.spec.actor.actor_type, ActorType::Controller);
    assert_eq!(activity.spec.actor.name, "default-scheduler");
    assert_eq!(activity.spec.change_source, ChangeSource::System);
    assert_eq!(activity.spec.origin.origin_type, OriginType::Event);
    assert_eq!(activity.spec.origin.id, "event-123");
    assert_eq!(activity.spec.tenant.tenant_type, TenantType::Platform);
    assert_eq!(activity.spec.summary, "Pod my-pod was scheduled");
}

#[test]
fn normalization_makes_regarding_defined() {
    let mut event = make_event("event-123", "Scheduled");
    assert!(str_at(&event, &["regarding", "kind"]).is_none());

    normalize_event(&mut event);
    assert_eq!(str_at(&event, &["regarding", "kind"]), Some("Pod"));
    assert_eq!(str_at(&event, &["regarding", "name"]), Some("my-pod"));
}

// ── scenario: CEL summary failure ──

#[test]
fn summary_failure_emits_exactly_one_dead_letter_and_no_activity() {
    let cache = cache_with(vec![ready_policy(
        "deployment-activity",
        "apps",
        "Deployment",
        vec![(
            r#"audit.verb == "create""#,
            r#"audit.responseObject.status.phase"#, // responseObject is absent
        )],
        vec![],
    )]);
    let audit = make_audit("abcdef1234567890", "alice@example.com", "create");
    let payload = serde_json::to_vec(&audit).unwrap();

    let Outcome::DeadLetter(event) = process_audit(&payload, &cache, Utc::now()) else {
        panic!("expected a dead letter");
    };

    assert_eq!(event.error_type, DlqErrorType::CelSummary);
    assert_eq!(event.policy_name.as_deref(), Some("deployment-activity"));
    assert_eq!(event.rule_index, 0);
    assert_eq!(
        dead_letter_subject("activity.dlq", &event),
        "activity.dlq.audit.apps.Deployment"
    );
}

// ── readiness gate ──

#[test]
fn policy_without_ready_condition_never_produces_activities() {
    let mut policy = deployment_create_policy();
    policy.status = None;

    let cache = cache_with(vec![]);
    cache.apply(&policy).expect("apply should not error");

    let audit = make_audit("abcdef1234567890", "alice@example.com", "create");
    let payload = serde_json::to_vec(&audit).unwrap();
    let outcome = process_audit(&payload, &cache, Utc::now());
    assert!(matches!(outcome, Outcome::Skip(SkipReason::NoPolicyMatched)));
}

// ── message-ID determinism (the broker half of the dedup contract) ──

#[test]
fn repeated_delivery_of_same_audit_yields_same_message_id() {
    let cache = cache_with(vec![deployment_create_policy()]);
    let audit = make_audit("abcdef1234567890", "alice@example.com", "create");
    let payload = serde_json::to_vec(&audit).unwrap();

    let name = |outcome: Outcome| -> String {
        match outcome {
            Outcome::Publish(activity) => activity.metadata.name.clone(),
            other => panic!("expected an activity, got {other:?}"),
        }
    };

    let first = name(process_audit(&payload, &cache, Utc::now()));
    let second = name(process_audit(&payload, &cache, Utc::now()));
    // the broker collapses redeliveries because the message-ID is the name
    assert_eq!(first, second);

    let subject = |outcome: Outcome| -> String {
        match outcome {
            Outcome::Publish(activity) => build_activity_subject("activities", &activity),
            other => panic!("expected an activity, got {other:?}"),
        }
    };
    assert_eq!(
        subject(process_audit(&payload, &cache, Utc::now())),
        subject(process_audit(&payload, &cache, Utc::now()))
    );
}

// ── tenant extraction through the full pipeline ──

#[test]
fn tenant_attribution_flows_into_subject() {
    let cache = cache_with(vec![deployment_create_policy()]);
    let mut audit = make_audit("abcdef1234567890", "alice@example.com", "create");
    audit["user"]["extra"] = serde_json::json!({
        "resourcemanager.platform.io/project": ["rollout"]
    });
    let payload = serde_json::to_vec(&audit).unwrap();

    let Outcome::Publish(activity) = process_audit(&payload, &cache, Utc::now()) else {
        panic!("expected an activity");
    };

    assert_eq!(activity.spec.tenant.tenant_type, TenantType::Project);
    assert_eq!(activity.spec.tenant.name, "rollout");
    assert_eq!(
        build_activity_subject("activities", &activity),
        "activities.project.rollout.apps.audit.Deployment.staging.act-abcdef12"
    );
}
