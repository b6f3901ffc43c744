//! Plural-resource to kind resolution.
//!
//! Audits reference resources by plural name while policies and activities
//! are keyed by kind. Resolution is a synchronous table lookup on the hot
//! path; the discovery-backed resolver snapshots the cluster's API surface
//! once at startup.

use std::collections::HashMap;

use kube::Client;
use kube::discovery::Discovery;

/// Resolves a plural resource name to its kind within an API group.
pub trait KindResolver: Send + Sync {
    fn kind_for_resource(&self, api_group: &str, resource_plural: &str) -> Option<String>;
}

/* ============================= STATIC RESOLVER ============================= */

/// Table-backed resolver.
///
/// Ships with the built-in resources every cluster serves, so the pipeline
/// keeps resolving when discovery is unavailable. Extra entries can be layered
/// on top for custom resources.
pub struct StaticKindResolver {
    table: HashMap<(String, String), String>,
}

const BUILTIN_KINDS: &[(&str, &str, &str)] = &[
    ("", "pods", "Pod"),
    ("", "services", "Service"),
    ("", "configmaps", "ConfigMap"),
    ("", "secrets", "Secret"),
    ("", "namespaces", "Namespace"),
    ("", "nodes", "Node"),
    ("", "events", "Event"),
    ("", "endpoints", "Endpoints"),
    ("", "persistentvolumes", "PersistentVolume"),
    ("", "persistentvolumeclaims", "PersistentVolumeClaim"),
    ("", "serviceaccounts", "ServiceAccount"),
    ("apps", "deployments", "Deployment"),
    ("apps", "statefulsets", "StatefulSet"),
    ("apps", "daemonsets", "DaemonSet"),
    ("apps", "replicasets", "ReplicaSet"),
    ("batch", "jobs", "Job"),
    ("batch", "cronjobs", "CronJob"),
    ("networking.k8s.io", "ingresses", "Ingress"),
    ("networking.k8s.io", "networkpolicies", "NetworkPolicy"),
    ("rbac.authorization.k8s.io", "roles", "Role"),
    ("rbac.authorization.k8s.io", "rolebindings", "RoleBinding"),
    ("rbac.authorization.k8s.io", "clusterroles", "ClusterRole"),
    ("rbac.authorization.k8s.io", "clusterrolebindings", "ClusterRoleBinding"),
    ("autoscaling", "horizontalpodautoscalers", "HorizontalPodAutoscaler"),
    ("policy", "poddisruptionbudgets", "PodDisruptionBudget"),
    ("storage.k8s.io", "storageclasses", "StorageClass"),
    ("activity.platform.io", "activitypolicies", "ActivityPolicy"),
    ("activity.platform.io", "reindexjobs", "ReindexJob"),
];

impl StaticKindResolver {
    /// Resolver seeded with the built-in Kubernetes resources.
    pub fn builtin() -> Self {
        let table = BUILTIN_KINDS
            .iter()
            .map(|(group, plural, kind)| {
                ((group.to_string(), plural.to_string()), kind.to_string())
            })
            .collect();
        StaticKindResolver { table }
    }

    /// Empty resolver; useful for tests exercising resolution failure.
    pub fn empty() -> Self {
        StaticKindResolver {
            table: HashMap::new(),
        }
    }

    pub fn insert(&mut self, api_group: &str, resource_plural: &str, kind: &str) {
        self.table.insert(
            (api_group.to_string(), resource_plural.to_string()),
            kind.to_string(),
        );
    }
}

impl KindResolver for StaticKindResolver {
    fn kind_for_resource(&self, api_group: &str, resource_plural: &str) -> Option<String> {
        self.table
            .get(&(api_group.to_string(), resource_plural.to_string()))
            .cloned()
    }
}

/* ============================= DISCOVERY RESOLVER ============================= */

/// Resolver built from a discovery snapshot of the connected cluster.
///
/// Falls back to the built-in table for entries discovery did not return,
/// so a partially failed discovery run still resolves the common kinds.
pub struct DiscoveryKindResolver {
    table: HashMap<(String, String), String>,
    fallback: StaticKindResolver,
}

impl DiscoveryKindResolver {
    pub async fn from_cluster(client: Client) -> kube::Result<Self> {
        let discovery = Discovery::new(client).run().await?;

        let mut table = HashMap::new();
        for group in discovery.groups() {
            for (resource, _capabilities) in group.recommended_resources() {
                table.insert(
                    (resource.group.clone(), resource.plural.clone()),
                    resource.kind.clone(),
                );
            }
        }

        tracing::info!(resources = table.len(), "kind_resolver_snapshot_built");

        Ok(DiscoveryKindResolver {
            table,
            fallback: StaticKindResolver::builtin(),
        })
    }
}

impl KindResolver for DiscoveryKindResolver {
    fn kind_for_resource(&self, api_group: &str, resource_plural: &str) -> Option<String> {
        self.table
            .get(&(api_group.to_string(), resource_plural.to_string()))
            .cloned()
            .or_else(|| self.fallback.kind_for_resource(api_group, resource_plural))
    }
}

/* ============================= TESTS ============================= */
