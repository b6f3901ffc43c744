//! The stream-processing pipelines.
//!
//! Two symmetric consumer pools (audit, event) fetch batches from their
//! durable pull consumers, decide a per-message outcome with a pure
//! function, then publish/ack/nak accordingly. The decision logic never
//! touches the broker, which is what the tests exercise.

use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use async_nats::jetstream;
use async_nats::jetstream::AckKind;
use async_nats::jetstream::consumer::PullConsumer;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use prometheus::{IntCounter, IntCounterVec, Registry};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::activity::{Activity, OriginType, build_activity_subject, extract_tenant};
use crate::broker::ACTIVITY_SUBJECT_PREFIX;
use crate::broker::publish_with_retry;
use crate::cache::PolicyCache;
use crate::dlq::{DeadLetterEvent, DeadLetterSink, DlqErrorType, DlqEventType, DlqResource};
use crate::record;

/* ============================= OUTCOME ============================= */

/// Why a message was acked without producing anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The record carries no subject resource to match on.
    NoSubjectResource,
    /// No Ready policy matched.
    NoPolicyMatched,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::NoSubjectResource => "no_subject_resource",
            SkipReason::NoPolicyMatched => "no_policy_matched",
        }
    }
}

/// Per-message decision, computed without side effects.
#[derive(Debug)]
pub enum Outcome {
    /// Ack silently.
    Skip(SkipReason),
    /// Publish the activity, then ack (nak on publish failure).
    Publish(Box<Activity>),
    /// Publish the envelope to the DLQ, then ack (nak on DLQ failure).
    DeadLetter(Box<DeadLetterEvent>),
}

/* ============================= AUDIT PIPELINE ============================= */

/// Decide the outcome for one audit message.
pub fn process_audit(payload: &[u8], cache: &PolicyCache, now: DateTime<Utc>) -> Outcome {
    let audit: Value = match serde_json::from_slice(payload) {
        Ok(Value::Object(map)) => Value::Object(map),
        Ok(_) => {
            return Outcome::DeadLetter(Box::new(DeadLetterEvent::unmarshal(
                DlqEventType::Audit,
                payload,
                "audit record is not a JSON object",
            )));
        }
        Err(err) => {
            return Outcome::DeadLetter(Box::new(DeadLetterEvent::unmarshal(
                DlqEventType::Audit,
                payload,
                &err.to_string(),
            )));
        }
    };

    let Some((api_group, resource_plural)) = record::audit_resource(&audit) else {
        return Outcome::Skip(SkipReason::NoSubjectResource);
    };

    let dlq_resource = || {
        Some(DlqResource {
            api_group: api_group.clone(),
            kind: cache
                .resolver()
                .kind_for_resource(&api_group, &resource_plural)
                .unwrap_or_else(|| resource_plural.clone()),
            name: record::str_at(&audit, &["objectRef", "name"]).map(str::to_string),
            namespace: record::str_at(&audit, &["objectRef", "namespace"]).map(str::to_string),
        })
    };

    let matched = match cache.match_audit(&api_group, &resource_plural, &audit) {
        Ok(Some(matched)) => matched,
        Ok(None) => return Outcome::Skip(SkipReason::NoPolicyMatched),
        Err(err) => {
            let tenant = Some(extract_tenant(&audit));
            let resource = dlq_resource();
            return Outcome::DeadLetter(Box::new(DeadLetterEvent::evaluation(
                DlqEventType::Audit,
                audit,
                &err,
                tenant,
                resource,
            )));
        }
    };

    match crate::activity::build_audit_activity(&audit, &matched, cache.resolver().as_ref(), now) {
        Ok(activity) => Outcome::Publish(Box::new(activity)),
        Err(err) => {
            let tenant = Some(extract_tenant(&audit));
            let resource = dlq_resource();
            Outcome::DeadLetter(Box::new(DeadLetterEvent::evaluation(
                DlqEventType::Audit,
                audit,
                &err,
                tenant,
                resource,
            )))
        }
    }
}

/* ============================= EVENT PIPELINE ============================= */

/// Decide the outcome for one Kubernetes Event message.
///
/// The record is normalized first so evaluators uniformly read `regarding`.
pub fn process_event(payload: &[u8], cache: &PolicyCache, now: DateTime<Utc>) -> Outcome {
    let mut event: Value = match serde_json::from_slice(payload) {
        Ok(Value::Object(map)) => Value::Object(map),
        Ok(_) => {
            return Outcome::DeadLetter(Box::new(DeadLetterEvent::unmarshal(
                DlqEventType::K8sEvent,
                payload,
                "event record is not a JSON object",
            )));
        }
        Err(err) => {
            return Outcome::DeadLetter(Box::new(DeadLetterEvent::unmarshal(
                DlqEventType::K8sEvent,
                payload,
                &err.to_string(),
            )));
        }
    };

    record::normalize_event(&mut event);

    let Some((api_group, kind)) = record::event_resource(&event) else {
        return Outcome::Skip(SkipReason::NoSubjectResource);
    };

    let dlq_resource = || {
        Some(DlqResource {
            api_group: api_group.clone(),
            kind: kind.clone(),
            name: record::str_at(&event, &["regarding", "name"]).map(str::to_string),
            namespace: record::str_at(&event, &["regarding", "namespace"]).map(str::to_string),
        })
    };

    let matched = match cache.match_event(&api_group, &kind, &event) {
        Ok(Some(matched)) => matched,
        Ok(None) => return Outcome::Skip(SkipReason::NoPolicyMatched),
        Err(err) => {
            let resource = dlq_resource();
            return Outcome::DeadLetter(Box::new(DeadLetterEvent::evaluation(
                DlqEventType::K8sEvent,
                event,
                &err,
                None,
                resource,
            )));
        }
    };

    match crate::activity::build_event_activity(&event, &matched, cache.resolver().as_ref(), now) {
        Ok(activity) => Outcome::Publish(Box::new(activity)),
        Err(err) => {
            let resource = dlq_resource();
            Outcome::DeadLetter(Box::new(DeadLetterEvent::evaluation(
                DlqEventType::K8sEvent,
                event,
                &err,
                None,
                resource,
            )))
        }
    }
}

/* ============================= METRICS ============================= */

static METRICS_REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Counters shared by both consumer pools, labeled by origin.
pub struct ProcessorMetrics {
    pub messages_fetched: IntCounterVec,
    pub activities_published: IntCounterVec,
    pub dead_lettered: IntCounterVec,
    pub skipped: IntCounterVec,
    pub naks: IntCounterVec,
    pub policy_errors: IntCounter,
}

impl ProcessorMetrics {
    pub fn new() -> Self {
        let messages_fetched = IntCounterVec::new(
            prometheus::Opts::new(
                "activity_messages_fetched_total",
                "Messages fetched from the input streams",
            ),
            &["origin"],
        )
        .expect("metric definition is valid");
        let activities_published = IntCounterVec::new(
            prometheus::Opts::new(
                "activity_published_total",
                "Activities published to the output stream",
            ),
            &["origin"],
        )
        .expect("metric definition is valid");
        let dead_lettered = IntCounterVec::new(
            prometheus::Opts::new(
                "activity_dead_lettered_total",
                "Messages routed to the dead-letter stream",
            ),
            &["origin", "error_type"],
        )
        .expect("metric definition is valid");
        let skipped = IntCounterVec::new(
            prometheus::Opts::new(
                "activity_messages_skipped_total",
                "Messages acked without producing an activity",
            ),
            &["origin", "reason"],
        )
        .expect("metric definition is valid");
        let naks = IntCounterVec::new(
            prometheus::Opts::new(
                "activity_messages_naked_total",
                "Messages naked back to the broker for redelivery",
            ),
            &["origin"],
        )
        .expect("metric definition is valid");
        let policy_errors = IntCounter::new(
            "activity_policy_errors_total",
            "Policy match-expression failures",
        )
        .expect("metric definition is valid");

        for collector in [
            Box::new(messages_fetched.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(activities_published.clone()),
            Box::new(dead_lettered.clone()),
            Box::new(skipped.clone()),
            Box::new(naks.clone()),
            Box::new(policy_errors.clone()),
        ] {
            // a second ProcessorMetrics in the same process reuses the
            // registered collectors
            let _ = METRICS_REGISTRY.register(collector);
        }

        ProcessorMetrics {
            messages_fetched,
            activities_published,
            dead_lettered,
            skipped,
            naks,
            policy_errors,
        }
    }

    pub fn registry() -> &'static Registry {
        &METRICS_REGISTRY
    }
}

impl Default for ProcessorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/* ============================= WORKER POOL ============================= */

#[derive(Clone)]
pub struct ConsumerConfig {
    /// Parallel workers per pipeline.
    pub workers: usize,
    /// Messages fetched per batch.
    pub batch_size: usize,
    /// Bounded fetch wait; elapsing yields an empty batch, not an error.
    pub fetch_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        ConsumerConfig {
            workers: 4,
            batch_size: 100,
            fetch_timeout: Duration::from_secs(5),
        }
    }
}

/// Spawn `workers` identical workers bound to the pipeline's pull consumer.
pub fn spawn_workers(
    origin: OriginType,
    js: jetstream::Context,
    consumer: PullConsumer,
    cache: Arc<PolicyCache>,
    dlq: Arc<dyn DeadLetterSink>,
    metrics: Arc<ProcessorMetrics>,
    config: ConsumerConfig,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..config.workers)
        .map(|worker_id| {
            let js = js.clone();
            let consumer = consumer.clone();
            let cache = cache.clone();
            let dlq = dlq.clone();
            let metrics = metrics.clone();
            let config = config.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                worker_loop(
                    origin, worker_id, js, consumer, cache, dlq, metrics, config, shutdown,
                )
                .await;
            })
        })
        .collect()
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    origin: OriginType,
    worker_id: usize,
    js: jetstream::Context,
    consumer: PullConsumer,
    cache: Arc<PolicyCache>,
    dlq: Arc<dyn DeadLetterSink>,
    metrics: Arc<ProcessorMetrics>,
    config: ConsumerConfig,
    shutdown: CancellationToken,
) {
    let origin_label = origin.to_string();
    info!(origin = %origin_label, worker = worker_id, "consumer_worker_started");

    loop {
        // cancellation lands here, between batches; an in-flight batch
        // below always finishes and acks first
        let fetch = consumer
            .fetch()
            .max_messages(config.batch_size)
            .expires(config.fetch_timeout)
            .messages();

        let batch = tokio::select! {
            _ = shutdown.cancelled() => break,
            batch = fetch => batch,
        };

        let mut messages = match batch {
            Ok(messages) => messages,
            Err(err) => {
                warn!(origin = %origin_label, error = %err, "batch_fetch_failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        while let Some(next) = messages.next().await {
            let message = match next {
                Ok(message) => message,
                Err(err) => {
                    warn!(origin = %origin_label, error = %err, "batch_message_error");
                    continue;
                }
            };
            metrics.messages_fetched.with_label_values(&[&origin_label]).inc();

            let outcome = match origin {
                OriginType::Audit => process_audit(&message.payload, &cache, Utc::now()),
                OriginType::Event => process_event(&message.payload, &cache, Utc::now()),
            };

            handle_outcome(&origin_label, outcome, &message, &js, &dlq, &metrics).await;
        }
    }

    info!(origin = %origin_label, worker = worker_id, "consumer_worker_stopped");
}

async fn handle_outcome(
    origin_label: &str,
    outcome: Outcome,
    message: &jetstream::Message,
    js: &jetstream::Context,
    dlq: &Arc<dyn DeadLetterSink>,
    metrics: &ProcessorMetrics,
) {
    match outcome {
        Outcome::Skip(reason) => {
            metrics
                .skipped
                .with_label_values(&[origin_label, reason.as_str()])
                .inc();
            ack(message, origin_label).await;
        }

        Outcome::Publish(activity) => {
            let subject = build_activity_subject(ACTIVITY_SUBJECT_PREFIX, &activity);
            let payload = match serde_json::to_vec(activity.as_ref()) {
                Ok(payload) => payload,
                Err(err) => {
                    // cannot happen for a well-formed Activity; never lose
                    // the message over it
                    warn!(error = %err, "activity_serialization_failed");
                    nak(message, origin_label, metrics).await;
                    return;
                }
            };

            match publish_with_retry(js, &subject, &activity.metadata.name, payload).await {
                Ok(()) => {
                    metrics
                        .activities_published
                        .with_label_values(&[origin_label])
                        .inc();
                    debug!(subject = %subject, "activity_published");
                    ack(message, origin_label).await;
                }
                Err(err) => {
                    warn!(subject = %subject, error = %err, "activity_publish_failed");
                    nak(message, origin_label, metrics).await;
                }
            }
        }

        Outcome::DeadLetter(event) => {
            if event.error_type == DlqErrorType::CelMatch {
                metrics.policy_errors.inc();
            }
            metrics
                .dead_lettered
                .with_label_values(&[origin_label, event.error_type.as_str()])
                .inc();

            match dlq.publish(&event).await {
                Ok(()) => ack(message, origin_label).await,
                Err(err) => {
                    warn!(error = %err, "dead_letter_publish_failed");
                    nak(message, origin_label, metrics).await;
                }
            }
        }
    }
}

async fn ack(message: &jetstream::Message, origin_label: &str) {
    if let Err(err) = message.ack().await {
        warn!(origin = %origin_label, error = %err, "ack_failed");
    }
}

async fn nak(message: &jetstream::Message, origin_label: &str, metrics: &ProcessorMetrics) {
    metrics.naks.with_label_values(&[origin_label]).inc();
    if let Err(err) = message.ack_with(AckKind::Nak(None)).await {
        warn!(origin = %origin_label, error = %err, "nak_failed");
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{ActorType, ChangeSource, TenantType};
    use crate::crd::{
        ActivityPolicy, ActivityPolicySpec, ActivityPolicyStatus, CONDITION_READY, Condition,
        PolicyResource, PolicyRule,
    };
    use crate::resolve::StaticKindResolver;
    use serde_json::json;

    fn ready(mut policy: ActivityPolicy) -> ActivityPolicy {
        policy.status = Some(ActivityPolicyStatus {
            observed_generation: Some(1),
            conditions: vec![Condition::new(CONDITION_READY, true, "ExpressionsValid", "")],
        });
        policy
    }

    fn deployment_policy(match_expr: &str, summary: &str) -> ActivityPolicy {
        ready(ActivityPolicy::new(
            "deployment-activity",
            ActivityPolicySpec {
                resource: PolicyResource {
                    api_group: "apps".to_string(),
                    kind: "Deployment".to_string(),
                },
                audit_rules: vec![PolicyRule {
                    match_expression: match_expr.to_string(),
                    summary: summary.to_string(),
                }],
                event_rules: vec![],
            },
        ))
    }

    fn pod_event_policy() -> ActivityPolicy {
        ready(ActivityPolicy::new(
            "pod-events",
            ActivityPolicySpec {
                resource: PolicyResource {
                    api_group: String::new(),
                    kind: "Pod".to_string(),
                },
                audit_rules: vec![],
                event_rules: vec![PolicyRule {
                    match_expression: r#"event.reason == "Scheduled""#.to_string(),
                    summary: r#""Pod " + event.regarding.name + " was scheduled""#.to_string(),
                }],
            },
        ))
    }

    fn cache_with(policies: Vec<ActivityPolicy>) -> PolicyCache {
        let cache = PolicyCache::new(Arc::new(StaticKindResolver::builtin()));
        for policy in &policies {
            cache.apply(policy).expect("policy should install");
        }
        cache
    }

    fn sample_audit_bytes() -> Vec<u8> {
        serde_json::to_vec(&json!({
            "auditID": "abcdef1234567890",
            "verb": "create",
            "user": {"username": "alice@example.com", "uid": "u1"},
            "objectRef": {
                "apiGroup": "apps",
                "apiVersion": "apps/v1",
                "resource": "deployments",
                "namespace": "staging",
                "name": "my-deploy"
            },
            "requestReceivedTimestamp": "2026-02-27T10:00:00Z"
        }))
        .unwrap()
    }

    // ── audit happy path (end-to-end scenario) ──

    #[test]
    fn test_audit_to_activity_happy_path() {
        let cache = cache_with(vec![deployment_policy(
            r#"audit.verb == "create""#,
            r#""Deployment " + audit.objectRef.name + " was created""#,
        )]);

        let outcome = process_audit(&sample_audit_bytes(), &cache, Utc::now());
        let Outcome::Publish(activity) = outcome else {
            panic!("expected Publish, got {outcome:?}");
        };

        assert_eq!(activity.metadata.name, "act-abcdef12");
        assert_eq!(activity.spec.actor.actor_type, ActorType::User);
        assert_eq!(activity.spec.actor.name, "alice@example.com");
        assert_eq!(activity.spec.actor.uid, "u1");
        assert_eq!(activity.spec.change_source, ChangeSource::Human);
        assert_eq!(activity.spec.summary, "Deployment my-deploy was created");
        assert_eq!(activity.spec.origin.id, "abcdef1234567890");
        assert_eq!(
            build_activity_subject(ACTIVITY_SUBJECT_PREFIX, &activity),
            "activities.platform._.apps.audit.Deployment.staging.act-abcdef12"
        );
    }

    #[test]
    fn test_system_audit_classification() {
        let cache = cache_with(vec![deployment_policy(r#"true"#, r#""s""#)]);

        let mut audit: Value = serde_json::from_slice(&sample_audit_bytes()).unwrap();
        audit["user"]["username"] = json!("system:controller:replicaset-controller");
        let payload = serde_json::to_vec(&audit).unwrap();

        let Outcome::Publish(activity) = process_audit(&payload, &cache, Utc::now()) else {
            panic!("expected Publish");
        };
        assert_eq!(activity.spec.change_source, ChangeSource::System);
        assert_eq!(activity.spec.actor.actor_type, ActorType::System);
        assert_eq!(activity.spec.actor.name, "controller:replicaset-controller");
    }

    #[test]
    fn test_empty_audit_id_gets_random_name() {
        let cache = cache_with(vec![deployment_policy(r#"true"#, r#""s""#)]);

        let mut audit: Value = serde_json::from_slice(&sample_audit_bytes()).unwrap();
        audit.as_object_mut().unwrap().remove("auditID");
        audit["objectRef"].as_object_mut().unwrap().remove("namespace");
        let payload = serde_json::to_vec(&audit).unwrap();

        let Outcome::Publish(activity) = process_audit(&payload, &cache, Utc::now()) else {
            panic!("expected Publish");
        };
        assert!(activity.metadata.name.starts_with("act-"));
        assert_eq!(activity.spec.origin.id, "");
        let subject = build_activity_subject(ACTIVITY_SUBJECT_PREFIX, &activity);
        assert!(subject.contains(".Deployment._.act-"));
    }

    // ── event pipeline ──

    #[test]
    fn test_event_with_involved_object_only() {
        let cache = cache_with(vec![pod_event_policy()]);

        let payload = serde_json::to_vec(&json!({
            "metadata": {"uid": "event-123", "creationTimestamp": "2024-01-15T10:30:00Z"},
            "reason": "Scheduled",
            "reportingController": "default-scheduler",
            "involvedObject": {"kind": "Pod", "apiVersion": "v1", "name": "my-pod",
                               "namespace": "default", "uid": "pod-456"}
        }))
        .unwrap();

        let Outcome::Publish(activity) = process_event(&payload, &cache, Utc::now()) else {
            panic!("expected Publish");
        };
        assert_eq!(activity.spec.actor.actor_type, ActorType::Controller);
        assert_eq!(activity.spec.actor.name, "default-scheduler");
        assert_eq!(activity.spec.change_source, ChangeSource::System);
        assert_eq!(activity.spec.origin.id, "event-123");
        assert_eq!(activity.spec.summary, "Pod my-pod was scheduled");
        assert_eq!(activity.spec.tenant.tenant_type, TenantType::Platform);
    }

    #[test]
    fn test_event_without_subject_is_skipped() {
        let cache = cache_with(vec![pod_event_policy()]);
        let payload = serde_json::to_vec(&json!({"reason": "Scheduled"})).unwrap();

        let outcome = process_event(&payload, &cache, Utc::now());
        assert!(matches!(
            outcome,
            Outcome::Skip(SkipReason::NoSubjectResource)
        ));
    }

    // ── dead-letter paths ──

    #[test]
    fn test_unmarshal_failure_dead_letters() {
        let cache = cache_with(vec![]);
        let outcome = process_audit(b"{not json", &cache, Utc::now());
        let Outcome::DeadLetter(event) = outcome else {
            panic!("expected DeadLetter");
        };
        assert_eq!(event.error_type, DlqErrorType::Unmarshal);
        assert_eq!(event.rule_index, -1);
    }

    #[test]
    fn test_non_object_payload_dead_letters() {
        let cache = cache_with(vec![]);
        let outcome = process_event(b"[1, 2, 3]", &cache, Utc::now());
        let Outcome::DeadLetter(event) = outcome else {
            panic!("expected DeadLetter");
        };
        assert_eq!(event.error_type, DlqErrorType::Unmarshal);
    }

    #[test]
    fn test_match_failure_dead_letters_cel_match() {
        let cache = cache_with(vec![deployment_policy(
            r#"audit.missing.field == "x""#,
            r#""s""#,
        )]);

        let Outcome::DeadLetter(event) =
            process_audit(&sample_audit_bytes(), &cache, Utc::now())
        else {
            panic!("expected DeadLetter");
        };
        assert_eq!(event.error_type, DlqErrorType::CelMatch);
        assert_eq!(event.policy_name.as_deref(), Some("deployment-activity"));
        assert_eq!(event.rule_index, 0);
        assert_eq!(event.resource.as_ref().unwrap().kind, "Deployment");
        assert_eq!(
            event.tenant.as_ref().unwrap().tenant_type,
            TenantType::Platform
        );
    }

    #[test]
    fn test_summary_failure_dead_letters_cel_summary() {
        // match succeeds, summary references a missing field
        let cache = cache_with(vec![deployment_policy(
            r#"audit.verb == "create""#,
            r#"audit.responseObject.status.phase"#,
        )]);

        let Outcome::DeadLetter(event) =
            process_audit(&sample_audit_bytes(), &cache, Utc::now())
        else {
            panic!("expected DeadLetter");
        };
        assert_eq!(event.error_type, DlqErrorType::CelSummary);
        assert_eq!(event.policy_name.as_deref(), Some("deployment-activity"));
        assert_eq!(event.rule_index, 0);
        assert_eq!(
            crate::dlq::dead_letter_subject("activity.dlq", &event),
            "activity.dlq.audit.apps.Deployment"
        );
    }

    #[test]
    fn test_link_kind_resolution_failure_dead_letters() {
        let cache = cache_with(vec![deployment_policy(
            r#"true"#,
            r#"{"summary": "s",
                "links": [{"marker": "w", "resource": {"apiGroup": "example.io",
                                                       "resource": "widgets"}}]}"#,
        )]);

        let Outcome::DeadLetter(event) =
            process_audit(&sample_audit_bytes(), &cache, Utc::now())
        else {
            panic!("expected DeadLetter");
        };
        assert_eq!(event.error_type, DlqErrorType::KindResolve);
    }

    // ── skips ──

    #[test]
    fn test_no_policy_is_silent_skip() {
        let cache = cache_with(vec![]);
        let outcome = process_audit(&sample_audit_bytes(), &cache, Utc::now());
        assert!(matches!(outcome, Outcome::Skip(SkipReason::NoPolicyMatched)));
    }

    #[test]
    fn test_audit_without_object_ref_is_skipped() {
        let cache = cache_with(vec![deployment_policy(r#"true"#, r#""s""#)]);
        let payload = serde_json::to_vec(&json!({"auditID": "x", "verb": "get"})).unwrap();
        let outcome = process_audit(&payload, &cache, Utc::now());
        assert!(matches!(
            outcome,
            Outcome::Skip(SkipReason::NoSubjectResource)
        ));
    }

    // ── readiness gate property ──

    #[test]
    fn test_not_ready_policy_never_matches() {
        let mut policy = deployment_policy(r#"true"#, r#""s""#);
        policy.status = None;

        let cache = PolicyCache::new(Arc::new(StaticKindResolver::builtin()));
        cache.apply(&policy).expect("apply should not error");

        let outcome = process_audit(&sample_audit_bytes(), &cache, Utc::now());
        assert!(matches!(outcome, Outcome::Skip(SkipReason::NoPolicyMatched)));
    }

    // ── metrics ──

    #[test]
    fn test_metrics_register_once() {
        let a = ProcessorMetrics::new();
        let _b = ProcessorMetrics::new();
        a.messages_fetched.with_label_values(&["audit"]).inc();

        let families = ProcessorMetrics::registry().gather();
        let names: Vec<&str> = families.iter().map(|f| f.get_name()).collect();
        assert!(names.contains(&"activity_messages_fetched_total"));
        assert!(names.contains(&"activity_dead_lettered_total"));
    }
}
