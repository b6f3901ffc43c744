//! Dead-letter envelope and publisher.
//!
//! Messages that fail processing in a way redelivery cannot fix are wrapped
//! in a diagnostic envelope and published to the dead-letter stream, then the
//! source message is acked. Only a DLQ publish failure naks the original.

use std::time::Duration;

use async_nats::jetstream;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::activity::Tenant;
use crate::broker::PipelineError;
use crate::policy::PolicyError;

/* ============================= ENVELOPE ============================= */

/// Which input pipeline produced the failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DlqEventType {
    #[serde(rename = "audit")]
    Audit,
    #[serde(rename = "k8s-event")]
    K8sEvent,
}

impl std::fmt::Display for DlqEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DlqEventType::Audit => "audit",
            DlqEventType::K8sEvent => "k8s-event",
        })
    }
}

/// Failure classification. Every value maps to exactly one treatment in the
/// consumer loop.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DlqErrorType {
    CelMatch,
    CelSummary,
    Unmarshal,
    KindResolve,
}

impl DlqErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DlqErrorType::CelMatch => "cel_match",
            DlqErrorType::CelSummary => "cel_summary",
            DlqErrorType::Unmarshal => "unmarshal",
            DlqErrorType::KindResolve => "kind_resolve",
        }
    }
}

/// Classify a policy evaluation error for the envelope.
pub fn classify_policy_error(err: &PolicyError) -> DlqErrorType {
    match err {
        PolicyError::CelMatch { .. } => DlqErrorType::CelMatch,
        PolicyError::CelSummary { .. } => DlqErrorType::CelSummary,
        PolicyError::Compile { expression, .. } => {
            if *expression == "summary" {
                DlqErrorType::CelSummary
            } else {
                DlqErrorType::CelMatch
            }
        }
        PolicyError::KindResolve { .. } => DlqErrorType::KindResolve,
    }
}

/// Resource context attached to a dead-letter event when known.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DlqResource {
    #[serde(default)]
    pub api_group: String,

    #[serde(default)]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// The JSON envelope carried on the dead-letter stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEvent {
    #[serde(rename = "type")]
    pub event_type: DlqEventType,

    /// The message payload as received, preserved for replay.
    pub original_payload: Value,

    pub error: String,
    pub error_type: DlqErrorType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_name: Option<String>,

    /// Index of the failing rule; -1 when the failure precedes rule
    /// evaluation.
    pub rule_index: i32,

    pub timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<Tenant>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<DlqResource>,
}

impl DeadLetterEvent {
    /// Envelope for a payload that could not be unmarshalled.
    pub fn unmarshal(event_type: DlqEventType, payload: &[u8], error: &str) -> Self {
        DeadLetterEvent {
            event_type,
            original_payload: Value::String(String::from_utf8_lossy(payload).into_owned()),
            error: error.to_string(),
            error_type: DlqErrorType::Unmarshal,
            policy_name: None,
            rule_index: -1,
            timestamp: Utc::now(),
            tenant: None,
            resource: None,
        }
    }

    /// Envelope for a classified policy evaluation failure.
    pub fn evaluation(
        event_type: DlqEventType,
        payload: Value,
        err: &PolicyError,
        tenant: Option<Tenant>,
        resource: Option<DlqResource>,
    ) -> Self {
        DeadLetterEvent {
            event_type,
            original_payload: payload,
            error: err.to_string(),
            error_type: classify_policy_error(err),
            policy_name: err.policy_name().map(str::to_string),
            rule_index: err.rule_index(),
            timestamp: Utc::now(),
            tenant,
            resource,
        }
    }
}

/* ============================= SUBJECTS ============================= */

fn subject_token(raw: &str, fallback: &str) -> String {
    if raw.is_empty() {
        fallback.to_string()
    } else {
        raw.replace('.', "_")
    }
}

/// `<prefix>.<eventType>.<apiGroup|core|unknown>.<kind|unknown>`
pub fn dead_letter_subject(prefix: &str, event: &DeadLetterEvent) -> String {
    let (group, kind) = match &event.resource {
        Some(resource) => (
            subject_token(&resource.api_group, "core"),
            subject_token(&resource.kind, "unknown"),
        ),
        None => ("unknown".to_string(), "unknown".to_string()),
    };
    format!("{}.{}.{}.{}", prefix, event.event_type, group, kind)
}

/* ============================= SINK ============================= */

/// Where dead-letter envelopes go.
///
/// The consumer acks the source message only when this returns `Ok`; a
/// failed publish naks so the broker redelivers instead of losing the
/// message.
#[async_trait::async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn publish(&self, event: &DeadLetterEvent) -> Result<(), PipelineError>;
}

/// JetStream-backed sink with a bounded publish timeout.
pub struct JetStreamDeadLetterSink {
    js: jetstream::Context,
    prefix: String,
    timeout: Duration,
}

impl JetStreamDeadLetterSink {
    pub fn new(js: jetstream::Context, prefix: &str) -> Self {
        JetStreamDeadLetterSink {
            js,
            prefix: prefix.to_string(),
            timeout: Duration::from_secs(5),
        }
    }
}

#[async_trait::async_trait]
impl DeadLetterSink for JetStreamDeadLetterSink {
    async fn publish(&self, event: &DeadLetterEvent) -> Result<(), PipelineError> {
        let subject = dead_letter_subject(&self.prefix, event);
        let payload = serde_json::to_vec(event)
            .map_err(|e| PipelineError::DeadLetter(format!("envelope serialization: {e}")))?;

        let publish = async {
            self.js
                .publish(subject.clone(), payload.into())
                .await
                .map_err(|e| PipelineError::DeadLetter(e.to_string()))?
                .await
                .map_err(|e| PipelineError::DeadLetter(e.to_string()))
        };

        match tokio::time::timeout(self.timeout, publish).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::PublishTimeout(self.timeout)),
        }?;

        tracing::warn!(
            subject = %subject,
            error_type = event.error_type.as_str(),
            policy = event.policy_name.as_deref().unwrap_or(""),
            "dead_letter_published"
        );
        Ok(())
    }
}

/// Sink used when the DLQ is disabled by configuration.
///
/// Classification still happens upstream so counters stay consistent; the
/// envelope is simply dropped.
pub struct NoopDeadLetterSink;

#[async_trait::async_trait]
impl DeadLetterSink for NoopDeadLetterSink {
    async fn publish(&self, _event: &DeadLetterEvent) -> Result<(), PipelineError> {
        Ok(())
    }
}

/* ============================= TESTS ============================= */
