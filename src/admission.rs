//! Validating admission logic for the declarative resources.
//!
//! Pure functions; the webhook command wires them to the HTTPS handler.
//! ReindexJob specs are checked for shape on CREATE and frozen on UPDATE;
//! ActivityPolicy expressions must compile. Policy existence and system
//! readiness are validated asynchronously by the reconciler and surface as
//! conditions, not admission denials.

use chrono::{DateTime, Utc};

use crate::crd::{
    ActivityPolicy, MAX_BATCH_SIZE, MAX_RATE_LIMIT, MIN_BATCH_SIZE, MIN_RATE_LIMIT, ReindexJob,
    parse_rfc3339, retention_floor,
};
use crate::policy::compile_policy;

/* ============================= VERDICT ============================= */

/// Result of validating an admission request.
#[derive(Debug, Clone)]
pub struct AdmissionVerdict {
    pub allowed: bool,
    pub message: Option<String>,
    pub violations: Vec<String>,
}

impl AdmissionVerdict {
    fn allow() -> Self {
        AdmissionVerdict {
            allowed: true,
            message: None,
            violations: Vec::new(),
        }
    }

    fn from_violations(violations: Vec<String>) -> Self {
        if violations.is_empty() {
            Self::allow()
        } else {
            let message = format_denial_message(&violations);
            AdmissionVerdict {
                allowed: false,
                message: Some(message),
                violations,
            }
        }
    }
}

/// Format a human-readable denial message from a list of violations.
pub fn format_denial_message(violations: &[String]) -> String {
    format!("Denied: {}", violations.join(", "))
}

/* ============================= REINDEX JOB ============================= */

/// Validate a ReindexJob at creation time.
pub fn validate_reindex_create(job: &ReindexJob, now: DateTime<Utc>) -> AdmissionVerdict {
    let mut violations = Vec::new();
    let spec = &job.spec;

    // time range
    if spec.time_range.start_time.is_empty() {
        violations.push("spec.timeRange.startTime is required".to_string());
    }

    let start = if spec.time_range.start_time.is_empty() {
        None
    } else {
        let parsed = parse_rfc3339(&spec.time_range.start_time);
        if parsed.is_none() {
            violations.push(format!(
                "spec.timeRange.startTime '{}' is not a valid RFC 3339 timestamp",
                spec.time_range.start_time
            ));
        }
        parsed
    };

    let end = match &spec.time_range.end_time {
        Some(raw) => {
            let parsed = parse_rfc3339(raw);
            if parsed.is_none() {
                violations.push(format!(
                    "spec.timeRange.endTime '{raw}' is not a valid RFC 3339 timestamp"
                ));
            }
            parsed
        }
        None => Some(now),
    };

    if let (Some(start), Some(end)) = (start, end) {
        if start >= end {
            violations.push("spec.timeRange.startTime must be before endTime".to_string());
        }
        if start < retention_floor(now) {
            violations.push(format!(
                "spec.timeRange.startTime is outside the {}-day source retention",
                crate::crd::SOURCE_RETENTION_DAYS
            ));
        }
    }

    // config bounds
    if let Some(config) = &spec.config {
        if let Some(batch_size) = config.batch_size
            && !(MIN_BATCH_SIZE..=MAX_BATCH_SIZE).contains(&batch_size)
        {
            violations.push(format!(
                "spec.config.batchSize must be within [{MIN_BATCH_SIZE}, {MAX_BATCH_SIZE}]"
            ));
        }
        if let Some(rate_limit) = config.rate_limit
            && !(MIN_RATE_LIMIT..=MAX_RATE_LIMIT).contains(&rate_limit)
        {
            violations.push(format!(
                "spec.config.rateLimit must be within [{MIN_RATE_LIMIT}, {MAX_RATE_LIMIT}]"
            ));
        }
    }

    // selector exclusivity
    if let Some(selector) = &spec.policy_selector
        && selector.names.is_some()
        && selector.match_labels.is_some()
    {
        violations.push(
            "spec.policySelector.names and matchLabels are mutually exclusive".to_string(),
        );
    }

    if let Some(ttl) = spec.ttl_seconds_after_finished
        && ttl < 0
    {
        violations.push("spec.ttlSecondsAfterFinished must not be negative".to_string());
    }

    AdmissionVerdict::from_violations(violations)
}

/// Validate a ReindexJob update: the spec is immutable after creation.
///
/// Status and metadata changes pass; any spec difference is denied.
pub fn validate_reindex_update(old: &ReindexJob, new: &ReindexJob) -> AdmissionVerdict {
    if old.spec == new.spec {
        AdmissionVerdict::allow()
    } else {
        AdmissionVerdict::from_violations(vec![
            "spec is immutable after creation; create a new ReindexJob instead".to_string(),
        ])
    }
}

/* ============================= ACTIVITY POLICY ============================= */

/// Validate an ActivityPolicy: every rule expression must compile.
pub fn validate_policy(policy: &ActivityPolicy) -> AdmissionVerdict {
    let mut violations = Vec::new();

    if policy.spec.resource.kind.is_empty() {
        violations.push("spec.resource.kind is required".to_string());
    }
    if policy.spec.audit_rules.is_empty() && policy.spec.event_rules.is_empty() {
        violations.push("at least one audit or event rule is required".to_string());
    }

    if let Err(err) = compile_policy(policy) {
        violations.push(err.to_string());
    }

    AdmissionVerdict::from_violations(violations)
}

/* ============================= TESTS ============================= */
