use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/* ============================= SHARED TYPES ============================= */

/// API group served by both cluster-scoped resources.
pub const API_GROUP: &str = "activity.platform.io";

/// Condition carried on resource status.
///
/// Mirrors the upstream `metav1.Condition` shape; defined locally so it can
/// derive `JsonSchema` for CRD generation.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type, e.g. "Ready".
    #[serde(rename = "type")]
    pub condition_type: String,

    /// "True", "False" or "Unknown".
    pub status: String,

    /// Machine-readable reason for the last transition.
    pub reason: String,

    /// Human-readable detail.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// ISO 8601 timestamp of the last transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl Condition {
    pub fn new(condition_type: &str, status: bool, reason: &str, message: &str) -> Self {
        Condition {
            condition_type: condition_type.to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: Some(Utc::now().to_rfc3339()),
        }
    }
}

/// The condition type that gates policy participation in matching.
pub const CONDITION_READY: &str = "Ready";

/* ============================= ACTIVITY POLICY ============================= */

/// A single match/summary rule pair.
///
/// Both fields are opaque expression strings handed to the policy-language
/// evaluator. `match` must evaluate to a boolean; `summary` to a string or a
/// map carrying a summary string and link bindings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRule {
    /// Expression deciding whether this rule applies to a source record.
    #[serde(rename = "match")]
    pub match_expression: String,

    /// Expression rendering the human-readable summary (and optional links).
    pub summary: String,
}

/// The resource a policy targets, keyed by group and kind.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PolicyResource {
    /// API group of the target resource. Empty string for the core group.
    #[serde(default)]
    pub api_group: String,

    /// Kind of the target resource (singular, e.g. "Deployment").
    pub kind: String,
}

/// ActivityPolicy declares how source records become Activity records.
///
/// Audit rules run against API-server audit records, event rules against
/// Kubernetes Event objects. Rules are evaluated in declared order; the first
/// matching rule wins.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "activity.platform.io",
    version = "v1alpha1",
    kind = "ActivityPolicy",
    plural = "activitypolicies",
    status = "ActivityPolicyStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ActivityPolicySpec {
    /// The resource this policy applies to.
    pub resource: PolicyResource,

    /// Rules evaluated against audit records.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audit_rules: Vec<PolicyRule>,

    /// Rules evaluated against Kubernetes Event objects.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub event_rules: Vec<PolicyRule>,
}

/// Observed state of an ActivityPolicy.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ActivityPolicyStatus {
    /// The `.metadata.generation` that was last reconciled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Conditions, including the `Ready` gate.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl ActivityPolicy {
    /// Whether this policy carries a `Ready=True` condition.
    ///
    /// Policies without it never participate in matching.
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| {
                s.conditions
                    .iter()
                    .any(|c| c.condition_type == CONDITION_READY && c.status == "True")
            })
            .unwrap_or(false)
    }
}

/* ============================= REINDEX JOB ============================= */

/// Validation bounds for ReindexJob specs.
pub const MIN_BATCH_SIZE: u32 = 100;
pub const MAX_BATCH_SIZE: u32 = 10_000;
pub const MIN_RATE_LIMIT: u32 = 10;
pub const MAX_RATE_LIMIT: u32 = 1_000;

/// Defaults applied when `spec.config` omits a field.
pub const DEFAULT_BATCH_SIZE: u32 = 1_000;
pub const DEFAULT_RATE_LIMIT: u32 = 100;

/// Source tables retain records for this many days; jobs must not reach
/// further back.
pub const SOURCE_RETENTION_DAYS: i64 = 60;

/// Half-open time window `[startTime, endTime)` of source records to replay.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TimeRange {
    /// ISO 8601 start of the window (inclusive). Required.
    pub start_time: String,

    /// ISO 8601 end of the window (exclusive). Defaults to job creation time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
}

/// Selects which policies a re-index job replays through.
///
/// `names` and `matchLabels` are mutually exclusive; omitting both selects
/// every Ready policy.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PolicySelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub names: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_labels: Option<BTreeMap<String, String>>,
}

/// Tuning knobs for a re-index run.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReindexConfigSpec {
    /// Rows fetched per store page. Bounds: [100, 10000]. Default 1000.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u32>,

    /// Records processed per second. Bounds: [10, 1000]. Default 100.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<u32>,

    /// Evaluate and count but never publish.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dry_run: Option<bool>,
}

impl ReindexConfigSpec {
    pub fn effective_batch_size(&self) -> u32 {
        self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE)
    }

    pub fn effective_rate_limit(&self) -> u32 {
        self.rate_limit.unwrap_or(DEFAULT_RATE_LIMIT)
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run.unwrap_or(false)
    }
}

/// ReindexJob requests a replay of historical source records through the
/// current policy set.
///
/// The spec is immutable after creation; a new replay requires a new job.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[kube(
    group = "activity.platform.io",
    version = "v1alpha1",
    kind = "ReindexJob",
    plural = "reindexjobs",
    status = "ReindexJobStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ReindexJobSpec {
    /// Window of source records to replay.
    pub time_range: TimeRange,

    /// Which policies participate. Omitted = all Ready policies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_selector: Option<PolicySelector>,

    /// Batch size, rate limit and dry-run toggles.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ReindexConfigSpec>,

    /// Seconds after which the worker is garbage-collected once the job
    /// reaches a terminal phase. Omitted = the worker is kept.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_after_finished: Option<i64>,
}

impl ReindexJobSpec {
    pub fn effective_config(&self) -> ReindexConfigSpec {
        self.config.clone().unwrap_or_default()
    }

    /// Parsed `[start, end)` window; `end` falls back to `fallback_end`.
    pub fn parsed_window(
        &self,
        fallback_end: DateTime<Utc>,
    ) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let start = parse_rfc3339(&self.time_range.start_time)?;
        let end = match &self.time_range.end_time {
            Some(raw) => parse_rfc3339(raw)?,
            None => fallback_end,
        };
        Some((start, end))
    }
}

/// Lifecycle phase of a ReindexJob.
///
/// `Succeeded` and `Failed` are terminal; a job never leaves a terminal phase.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum ReindexPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl ReindexPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReindexPhase::Succeeded | ReindexPhase::Failed)
    }
}

impl std::fmt::Display for ReindexPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReindexPhase::Pending => "Pending",
            ReindexPhase::Running => "Running",
            ReindexPhase::Succeeded => "Succeeded",
            ReindexPhase::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Advisory progress counters, refined as batches complete.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReindexProgress {
    /// Estimated source records in the window (one count query per table).
    pub total_events: u64,

    /// Source records evaluated so far.
    pub processed_events: u64,

    /// Activities produced (counted even under dryRun).
    pub activities_generated: u64,

    /// Records that failed evaluation or publish.
    pub errors: u64,

    pub current_batch: u64,
    pub total_batches: u64,
}

/// Observed state of a ReindexJob.
///
/// Updated only through the status subresource; the worker process is the
/// writer for progress, the reconciler for phase transitions it owns.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReindexJobStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<ReindexPhase>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<ReindexProgress>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ReindexJob {
    pub fn phase(&self) -> ReindexPhase {
        self.status
            .as_ref()
            .and_then(|s| s.phase.clone())
            .unwrap_or_default()
    }

    pub fn is_terminal(&self) -> bool {
        self.phase().is_terminal()
    }
}

/* ============================= HELPERS ============================= */

/// Parse an ISO 8601 timestamp into UTC.
pub fn parse_rfc3339(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Oldest admissible start time given the source-table retention.
pub fn retention_floor(now: DateTime<Utc>) -> DateTime<Utc> {
    now - Duration::days(SOURCE_RETENTION_DAYS)
}

/* ============================= TESTS ============================= */
