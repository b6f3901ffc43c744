//! The canonical Activity record and its canonicalization rules.
//!
//! Everything that turns a raw source record plus a policy match into the
//! output shape lives here: actor and change-source classification, tenant
//! extraction, name generation, link conversion and subject layout.

use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::policy::{LinkBinding, MatchedPolicy, PolicyError};
use crate::record;
use crate::resolve::KindResolver;

/// apiVersion stamped on every emitted Activity.
pub const ACTIVITY_API_VERSION: &str = "activity.platform.io/v1alpha1";
pub const ACTIVITY_KIND: &str = "Activity";

/* ============================= TENANT ============================= */

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TenantType {
    #[default]
    Platform,
    Organization,
    Project,
    User,
}

impl TenantType {
    fn from_label(label: &str) -> TenantType {
        match label {
            "organization" => TenantType::Organization,
            "project" => TenantType::Project,
            "user" => TenantType::User,
            _ => TenantType::Platform,
        }
    }
}

impl std::fmt::Display for TenantType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TenantType::Platform => "platform",
            TenantType::Organization => "organization",
            TenantType::Project => "project",
            TenantType::User => "user",
        };
        f.write_str(s)
    }
}

/// The tenant an activity is attributed to.
///
/// The platform tenant with an empty name is the default; in subjects the
/// empty name renders as `_`, in storage as the empty string.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Tenant {
    #[serde(rename = "type")]
    pub tenant_type: TenantType,

    #[serde(default)]
    pub name: String,
}

/// `user.extra` keys carrying tenant attribution on audit records.
pub const EXTRA_PARENT_TYPE: &str = "resourcemanager.platform.io/parent-type";
pub const EXTRA_PARENT_NAME: &str = "resourcemanager.platform.io/parent-name";
pub const EXTRA_ORGANIZATION: &str = "resourcemanager.platform.io/organization";
pub const EXTRA_PROJECT: &str = "resourcemanager.platform.io/project";

fn first_extra<'a>(audit: &'a Value, key: &str) -> Option<&'a str> {
    record::value_at(audit, &["user", "extra", key])
        .and_then(Value::as_array)
        .and_then(|values| values.first())
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// Derive the tenant from an audit record's `user.extra`.
///
/// Parent-type/parent-name attribute directly; an `organization` entry
/// overrides them, and a `project` entry overrides the organization.
/// Everything else falls back to the platform tenant.
pub fn extract_tenant(audit: &Value) -> Tenant {
    let mut tenant = Tenant::default();

    if let (Some(parent_type), Some(parent_name)) = (
        first_extra(audit, EXTRA_PARENT_TYPE),
        first_extra(audit, EXTRA_PARENT_NAME),
    ) {
        tenant = Tenant {
            tenant_type: TenantType::from_label(parent_type),
            name: parent_name.to_string(),
        };
    }

    if let Some(org) = first_extra(audit, EXTRA_ORGANIZATION) {
        tenant = Tenant {
            tenant_type: TenantType::Organization,
            name: org.to_string(),
        };
    }

    if let Some(project) = first_extra(audit, EXTRA_PROJECT) {
        tenant = Tenant {
            tenant_type: TenantType::Project,
            name: project.to_string(),
        };
    }

    tenant
}

/* ============================= ACTOR ============================= */

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ActorType {
    User,
    System,
    Controller,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    #[serde(rename = "type")]
    pub actor_type: ActorType,

    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Classify the audit actor from its username.
///
/// `system:`-prefixed usernames are system actors named by the stripped
/// remainder; usernames containing `@` are users with the username doubling
/// as e-mail; anything else is a plain user. An empty username yields
/// "unknown". The UID propagates verbatim.
pub fn classify_actor(username: &str, uid: &str) -> Actor {
    if let Some(rest) = username.strip_prefix("system:") {
        return Actor {
            actor_type: ActorType::System,
            name: rest.to_string(),
            uid: uid.to_string(),
            email: None,
        };
    }
    if username.is_empty() {
        return Actor {
            actor_type: ActorType::User,
            name: "unknown".to_string(),
            uid: uid.to_string(),
            email: None,
        };
    }
    let email = username.contains('@').then(|| username.to_string());
    Actor {
        actor_type: ActorType::User,
        name: username.to_string(),
        uid: uid.to_string(),
        email,
    }
}

/// Event actors are always the reporting controller.
pub fn event_actor(event: &Value) -> Actor {
    let name = record::str_at(event, &["reportingController"])
        .or_else(|| record::str_at(event, &["source", "component"]))
        .filter(|s| !s.is_empty())
        .unwrap_or("unknown");
    Actor {
        actor_type: ActorType::Controller,
        name: name.to_string(),
        uid: String::new(),
        email: None,
    }
}

/* ============================= CHANGE SOURCE ============================= */

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChangeSource {
    Human,
    System,
}

/// Audits from `system:` principals (or with no username at all) are system
/// changes; everything else is human. Event-derived activities are always
/// system.
pub fn classify_change_source(username: &str) -> ChangeSource {
    if username.is_empty() || username.starts_with("system:") {
        ChangeSource::System
    } else {
        ChangeSource::Human
    }
}

/* ============================= RESOURCE & ORIGIN ============================= */

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    #[serde(default)]
    pub api_group: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OriginType {
    Audit,
    Event,
}

impl std::fmt::Display for OriginType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            OriginType::Audit => "audit",
            OriginType::Event => "event",
        })
    }
}

/// Source category and unique id of the record an activity came from.
///
/// `(tenant.type, tenant.name, timestamp, origin.id)` is the analytical
/// primary key; the id is unique per source record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Origin {
    #[serde(rename = "type")]
    pub origin_type: OriginType,

    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Link {
    pub marker: String,
    pub resource: ResourceRef,
}

/* ============================= ACTIVITY ============================= */

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActivityMeta {
    pub name: String,
    pub creation_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActivitySpec {
    pub tenant: Tenant,
    pub actor: Actor,
    pub change_source: ChangeSource,
    pub resource: ResourceRef,
    pub summary: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<Link>,

    pub origin: Origin,
}

/// Canonical output record of the pipeline.
///
/// `reindexVersion` is the store's version stamp: the newest value wins
/// during replacing-merge, which is what lets re-indexed rows overwrite
/// prior generations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    pub api_version: String,
    pub kind: String,
    pub metadata: ActivityMeta,
    pub spec: ActivitySpec,
    pub reindex_version: u64,
}

/// Monotonic insertion stamp (microseconds since epoch).
pub fn version_stamp() -> u64 {
    Utc::now().timestamp_micros().max(0) as u64
}

/* ============================= NAME GENERATION ============================= */

/// Random 8-character lowercase alphanumeric identifier.
pub fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

/// Derive the activity name (and broker message-ID) from the audit ID.
///
/// IDs of 8+ characters produce deterministic names so repeated deliveries
/// collapse at the broker; shorter IDs fall back to a random identifier and
/// rely on the store's primary-key merge instead.
pub fn generate_activity_name(audit_id: &str) -> String {
    if audit_id.chars().count() >= 8 {
        let prefix: String = audit_id.chars().take(8).collect();
        format!("act-{}", prefix.to_lowercase())
    } else {
        format!("act-{}", random_suffix())
    }
}

/* ============================= LINK CONVERSION ============================= */

/// Convert summary link bindings into activity links.
///
/// Kind precedence per binding: explicit `kind`, else plural `resource`
/// resolved through the kind resolver (resolution failure dead-letters the
/// message), else `type` for actor-like links.
pub fn convert_links(
    bindings: &[LinkBinding],
    resolver: &dyn KindResolver,
) -> Result<Vec<Link>, PolicyError> {
    bindings
        .iter()
        .map(|binding| {
            let get = |key: &str| -> Option<String> {
                binding
                    .resource
                    .get(key)
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
            };

            let api_group = get("apiGroup").unwrap_or_default();

            let kind = if let Some(kind) = get("kind") {
                kind
            } else if let Some(plural) = get("resource") {
                resolver
                    .kind_for_resource(&api_group, &plural)
                    .ok_or_else(|| PolicyError::KindResolve {
                        api_group: api_group.clone(),
                        resource: plural,
                    })?
            } else if let Some(actor_type) = get("type") {
                actor_type
            } else {
                return Err(PolicyError::KindResolve {
                    api_group: api_group.clone(),
                    resource: String::new(),
                });
            };

            Ok(Link {
                marker: binding.marker.clone(),
                resource: ResourceRef {
                    api_group,
                    api_version: get("apiVersion"),
                    kind,
                    namespace: get("namespace"),
                    name: get("name").unwrap_or_default(),
                    uid: get("uid"),
                },
            })
        })
        .collect()
}

/* ============================= BUILDERS ============================= */

/// Build the activity for a matched audit record.
///
/// `now` substitutes for records without a usable timestamp.
pub fn build_audit_activity(
    audit: &Value,
    matched: &MatchedPolicy,
    resolver: &dyn KindResolver,
    now: DateTime<Utc>,
) -> Result<Activity, PolicyError> {
    let audit_id = record::str_at_or_empty(audit, &["auditID"]);
    let username = record::str_at_or_empty(audit, &["user", "username"]);
    let uid = record::str_at_or_empty(audit, &["user", "uid"]);

    let timestamp = record::audit_timestamp(audit).unwrap_or_else(|| {
        tracing::debug!(audit_id = %audit_id, "audit_without_timestamp");
        now
    });

    let resource = ResourceRef {
        api_group: record::str_at_or_empty(audit, &["objectRef", "apiGroup"]).to_string(),
        api_version: record::str_at(audit, &["objectRef", "apiVersion"]).map(str::to_string),
        kind: matched.kind.clone(),
        namespace: record::str_at(audit, &["objectRef", "namespace"]).map(str::to_string),
        name: record::str_at_or_empty(audit, &["objectRef", "name"]).to_string(),
        uid: record::str_at(audit, &["objectRef", "uid"]).map(str::to_string),
    };

    Ok(Activity {
        api_version: ACTIVITY_API_VERSION.to_string(),
        kind: ACTIVITY_KIND.to_string(),
        metadata: ActivityMeta {
            name: generate_activity_name(audit_id),
            creation_timestamp: timestamp,
        },
        spec: ActivitySpec {
            tenant: extract_tenant(audit),
            actor: classify_actor(username, uid),
            change_source: classify_change_source(username),
            resource,
            summary: matched.summary.clone(),
            links: convert_links(&matched.links, resolver)?,
            origin: Origin {
                origin_type: OriginType::Audit,
                id: audit_id.to_string(),
            },
        },
        reindex_version: version_stamp(),
    })
}

/// Build the activity for a matched (normalized) event record.
pub fn build_event_activity(
    event: &Value,
    matched: &MatchedPolicy,
    resolver: &dyn KindResolver,
    now: DateTime<Utc>,
) -> Result<Activity, PolicyError> {
    let uid = record::str_at_or_empty(event, &["metadata", "uid"]);
    let timestamp = record::event_timestamp(event).unwrap_or(now);

    let api_version = record::str_at_or_empty(event, &["regarding", "apiVersion"]);
    let resource = ResourceRef {
        api_group: record::api_group_of(api_version).to_string(),
        api_version: (!api_version.is_empty()).then(|| api_version.to_string()),
        kind: matched.kind.clone(),
        namespace: record::str_at(event, &["regarding", "namespace"]).map(str::to_string),
        name: record::str_at_or_empty(event, &["regarding", "name"]).to_string(),
        uid: record::str_at(event, &["regarding", "uid"]).map(str::to_string),
    };

    Ok(Activity {
        api_version: ACTIVITY_API_VERSION.to_string(),
        kind: ACTIVITY_KIND.to_string(),
        metadata: ActivityMeta {
            name: format!("act-{}", random_suffix()),
            creation_timestamp: timestamp,
        },
        spec: ActivitySpec {
            tenant: Tenant::default(),
            actor: event_actor(event),
            change_source: ChangeSource::System,
            resource,
            summary: matched.summary.clone(),
            links: convert_links(&matched.links, resolver)?,
            origin: Origin {
                origin_type: OriginType::Event,
                id: uid.to_string(),
            },
        },
        reindex_version: version_stamp(),
    })
}

/* ============================= SUBJECTS ============================= */

/// Replace characters a broker subject token cannot carry and substitute a
/// fallback for the empty string.
fn subject_token(raw: &str, fallback: &str) -> String {
    if raw.is_empty() {
        fallback.to_string()
    } else {
        raw.replace('.', "_")
    }
}

/// Deterministic real-time output subject:
/// `<prefix>.<tenantType>.<tenantName|_>.<apiGroup|core>.<origin>.<kind>.<namespace|_>.<name>`
pub fn build_activity_subject(prefix: &str, activity: &Activity) -> String {
    let spec = &activity.spec;
    format!(
        "{}.{}.{}.{}.{}.{}.{}.{}",
        prefix,
        spec.tenant.tenant_type,
        subject_token(&spec.tenant.name, "_"),
        subject_token(&spec.resource.api_group, "core"),
        spec.origin.origin_type,
        spec.resource.kind,
        subject_token(spec.resource.namespace.as_deref().unwrap_or(""), "_"),
        activity.metadata.name,
    )
}

/// Re-index output subject:
/// `<prefix>.<tenantType>.<apiGroup|core>.<kind>`
pub fn build_reindex_subject(prefix: &str, activity: &Activity) -> String {
    let spec = &activity.spec;
    format!(
        "{}.{}.{}.{}",
        prefix,
        spec.tenant.tenant_type,
        subject_token(&spec.resource.api_group, "core"),
        spec.resource.kind,
    )
}

/* ============================= TESTS ============================= */
