//! Live policy index.
//!
//! The cache is the only shared mutable structure on the hot path. It is
//! written by the watcher task alone and read by every consumer worker; the
//! map entries are immutable compiled policies behind `Arc`, so readers never
//! block the writer and in-flight reads keep the snapshot they started with.

use std::sync::Arc;

use dashmap::DashMap;
use futures::StreamExt;
use kube::api::Api;
use kube::Client;
use kube_runtime::watcher::{watcher, Config, Event};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::crd::ActivityPolicy;
use crate::policy::{CompiledPolicy, MatchedPolicy, PolicyError, compile_policy};
use crate::resolve::KindResolver;

type IndexKey = (String, String);

/// Index of compiled policies keyed by `(apiGroup, kind)`.
pub struct PolicyCache {
    index: DashMap<IndexKey, Arc<CompiledPolicy>>,
    resolver: Arc<dyn KindResolver>,
}

impl PolicyCache {
    pub fn new(resolver: Arc<dyn KindResolver>) -> Self {
        PolicyCache {
            index: DashMap::new(),
            resolver,
        }
    }

    pub fn resolver(&self) -> &Arc<dyn KindResolver> {
        &self.resolver
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn key_of(policy: &ActivityPolicy) -> IndexKey {
        (
            policy.spec.resource.api_group.clone(),
            policy.spec.resource.kind.clone(),
        )
    }

    /// Install or refresh a policy.
    ///
    /// The readiness gate lives here: a policy without `Ready=True` is
    /// removed from the index rather than added, which is the single
    /// mechanism keeping unvalidated policies away from the consumers.
    /// Compilation failure also removes the entry; partial installs are
    /// never produced. Returns whether the policy is now installed.
    pub fn apply(&self, policy: &ActivityPolicy) -> Result<bool, PolicyError> {
        let key = Self::key_of(policy);

        if !policy.is_ready() {
            self.index.remove(&key);
            return Ok(false);
        }

        match compile_policy(policy) {
            Ok(compiled) => {
                self.index.insert(key, Arc::new(compiled));
                Ok(true)
            }
            Err(err) => {
                self.index.remove(&key);
                Err(err)
            }
        }
    }

    /// Drop a policy's entry. In-flight matches keep the snapshot they hold.
    pub fn remove(&self, policy: &ActivityPolicy) {
        self.index.remove(&Self::key_of(policy));
    }

    /// Replace the whole index from a fresh listing (watcher restart).
    pub fn resync(&self, policies: &[ActivityPolicy]) {
        self.index.clear();
        for policy in policies {
            if let Err(err) = self.apply(policy) {
                warn!(
                    policy = policy.metadata.name.as_deref().unwrap_or(""),
                    error = %err,
                    "policy_rejected_on_resync"
                );
            }
        }
    }

    fn lookup(&self, api_group: &str, kind: &str) -> Option<Arc<CompiledPolicy>> {
        self.index
            .get(&(api_group.to_string(), kind.to_string()))
            .map(|entry| entry.value().clone())
    }

    /// Match an audit record addressed by its plural resource name.
    ///
    /// The plural resolves to a kind through the discovery resolver; when it
    /// does not resolve, the plural itself is tried as the index key so
    /// policies registered for exotic resources still match.
    pub fn match_audit(
        &self,
        api_group: &str,
        resource_plural: &str,
        audit: &Value,
    ) -> Result<Option<MatchedPolicy>, PolicyError> {
        let identifier = self
            .resolver
            .kind_for_resource(api_group, resource_plural)
            .unwrap_or_else(|| resource_plural.to_string());

        match self.lookup(api_group, &identifier) {
            Some(policy) => policy.match_audit(audit),
            None => Ok(None),
        }
    }

    /// Match a normalized event record addressed by its kind.
    pub fn match_event(
        &self,
        api_group: &str,
        kind: &str,
        event: &Value,
    ) -> Result<Option<MatchedPolicy>, PolicyError> {
        match self.lookup(api_group, kind) {
            Some(policy) => policy.match_event(event),
            None => Ok(None),
        }
    }
}

/* ============================= WATCHER ============================= */

/// Follow ActivityPolicy changes until shutdown.
///
/// Runs on its own task; consumers only ever see complete index states
/// because entries are swapped whole.
pub async fn run_policy_watcher(
    client: Client,
    cache: Arc<PolicyCache>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let policies: Api<ActivityPolicy> = Api::all(client);
    let mut stream = watcher(policies, Config::default()).boxed();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("policy_watcher_stopped");
                return Ok(());
            }

            event = stream.next() => {
                match event {
                    Some(Ok(Event::Applied(policy))) => {
                        let name = policy.metadata.name.as_deref().unwrap_or("").to_string();
                        match cache.apply(&policy) {
                            Ok(true) => info!(policy = %name, "policy_installed"),
                            Ok(false) => info!(policy = %name, "policy_not_ready_skipped"),
                            Err(err) => warn!(policy = %name, error = %err, "policy_rejected"),
                        }
                    }
                    Some(Ok(Event::Deleted(policy))) => {
                        cache.remove(&policy);
                        info!(
                            policy = policy.metadata.name.as_deref().unwrap_or(""),
                            "policy_removed"
                        );
                    }
                    Some(Ok(Event::Restarted(policies))) => {
                        cache.resync(&policies);
                        info!(installed = cache.len(), "policy_cache_resynced");
                    }
                    Some(Err(err)) => {
                        warn!(error = %err, "policy_watch_error");
                    }
                    None => {
                        warn!("policy_watch_stream_ended");
                        return Ok(());
                    }
                }
            }
        }
    }
}

/* ============================= TESTS ============================= */
