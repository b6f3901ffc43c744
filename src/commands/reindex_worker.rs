use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::Client;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli::{NatsArgs, StoreArgs};
use kube_activity::broker::{self, BrokerHealth};
use kube_activity::cache::PolicyCache;
use kube_activity::crd::{ActivityPolicy, ReindexJob, ReindexPhase, ReindexProgress};
use kube_activity::reindex::{
    JetStreamReindexPublisher, ProgressSink, ReindexError, ReindexRunConfig, run_reindex,
};
use kube_activity::resolve::{DiscoveryKindResolver, KindResolver, StaticKindResolver};
use kube_activity::store::{ActivityStore, StoreConfig};

const FIELD_MANAGER: &str = "kube-activity-reindex-worker";

/* ============================= PROGRESS SINK ============================= */

/// Reports progress through the job's status subresource.
///
/// The job object is the ledger; this is the only coupling between the
/// worker process and the control plane.
struct KubeProgressSink {
    api: Api<ReindexJob>,
    job_name: String,
}

#[async_trait::async_trait]
impl ProgressSink for KubeProgressSink {
    async fn update(&self, progress: &ReindexProgress) -> Result<()> {
        self.api
            .patch_status(
                &self.job_name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&serde_json::json!({ "status": { "progress": progress } })),
            )
            .await?;
        Ok(())
    }
}

/* ============================= ENTRY ============================= */

pub async fn run(job_name: &str, nats: &NatsArgs, store: &StoreArgs) -> Result<()> {
    info!(job = %job_name, "reindex_worker_started");

    let client = Client::try_default()
        .await
        .context("Failed to load kubeconfig")?;
    let jobs_api: Api<ReindexJob> = Api::all(client.clone());

    let job = jobs_api
        .get(job_name)
        .await
        .with_context(|| format!("ReindexJob '{job_name}' not found"))?;

    if job.is_terminal() {
        bail!("ReindexJob '{job_name}' is already {}", job.phase());
    }

    let Some((start, end)) = job.spec.parsed_window(Utc::now()) else {
        let message = "spec.timeRange does not parse; admission should have rejected this job";
        fail_job(&jobs_api, job_name, message).await;
        bail!("{message}");
    };
    let config_spec = job.spec.effective_config();

    // policy set selected for this run, compiled into a local cache
    let resolver: Arc<dyn KindResolver> =
        match DiscoveryKindResolver::from_cluster(client.clone()).await {
            Ok(resolver) => Arc::new(resolver),
            Err(e) => {
                warn!(error = %e, "discovery_failed_using_builtin_resolver");
                Arc::new(StaticKindResolver::builtin())
            }
        };
    let cache = PolicyCache::new(resolver);

    let policies_api: Api<ActivityPolicy> = Api::all(client.clone());
    let all_policies = policies_api
        .list(&ListParams::default())
        .await
        .context("Cannot list ActivityPolicy objects")?;
    let selected: Vec<&ActivityPolicy> = all_policies
        .items
        .iter()
        .filter(|p| selected_by(&job, p))
        .collect();
    for policy in &selected {
        // the readiness gate inside apply drops not-Ready policies
        if let Err(e) = cache.apply(policy) {
            warn!(
                policy = policy.metadata.name.as_deref().unwrap_or(""),
                error = %e,
                "policy_skipped"
            );
        }
    }
    info!(
        selected = selected.len(),
        installed = cache.len(),
        "reindex_policy_set_ready"
    );

    if cache.is_empty() {
        let message = "no Ready policy matches the policySelector";
        fail_job(&jobs_api, job_name, message).await;
        bail!("{message}");
    }

    // broker and store
    let shutdown = CancellationToken::new();
    install_signal_handler(shutdown.clone());

    let nats_client = broker::connect(&nats.nats_url, BrokerHealth::new(), shutdown.clone())
        .await
        .context("Failed to connect to the broker")?;
    let js = async_nats::jetstream::new(nats_client.clone());
    broker::ensure_streams(&js).await?;

    let reader = ActivityStore::connect(&StoreConfig {
        url: store.clickhouse_url.clone(),
        database: store.clickhouse_database.clone(),
        user: store.clickhouse_user.clone(),
        password: store.clickhouse_password.clone(),
    });
    reader
        .ping()
        .await
        .context("Analytical store is unreachable")?;

    let publisher = JetStreamReindexPublisher::new(js);
    let progress_sink = KubeProgressSink {
        api: jobs_api.clone(),
        job_name: job_name.to_string(),
    };

    let run_config = ReindexRunConfig {
        start,
        end,
        batch_size: config_spec.effective_batch_size() as u64,
        rate_limit: config_spec.effective_rate_limit(),
        dry_run: config_spec.is_dry_run(),
    };

    let result = run_reindex(
        &reader,
        &cache,
        &publisher,
        &progress_sink,
        &run_config,
        &shutdown,
    )
    .await;

    match result {
        Ok(progress) => {
            let message = format!(
                "re-index completed: {} records processed, {} activities generated, {} errors",
                progress.processed_events, progress.activities_generated, progress.errors
            );
            info!(job = %job_name, "{message}");
            patch_terminal(
                &jobs_api,
                job_name,
                ReindexPhase::Succeeded,
                &message,
                Some(&progress),
            )
            .await;
        }
        Err(ReindexError::Cancelled) => {
            // hand the job back; the next reconcile restarts from the
            // window start and the store's merge keeps it idempotent
            warn!(job = %job_name, "reindex_worker_cancelled");
            let _ = jobs_api
                .patch_status(
                    job_name,
                    &PatchParams::apply(FIELD_MANAGER),
                    &Patch::Merge(&serde_json::json!({
                        "status": {
                            "phase": "Pending",
                            "message": "controller restarted, resuming from the beginning of the window",
                        }
                    })),
                )
                .await;
        }
        Err(err) => {
            let message = format!("re-index failed: {err}");
            warn!(job = %job_name, error = %err, "reindex_worker_failed");
            patch_terminal(&jobs_api, job_name, ReindexPhase::Failed, &message, None).await;
            broker::drain(nats_client).await;
            bail!("{message}");
        }
    }

    broker::drain(nats_client).await;
    info!(job = %job_name, "reindex_worker_stopped");
    Ok(())
}

/* ============================= HELPERS ============================= */

/// Whether a policy falls under the job's policySelector.
fn selected_by(job: &ReindexJob, policy: &ActivityPolicy) -> bool {
    let Some(selector) = &job.spec.policy_selector else {
        return true;
    };

    if let Some(names) = &selector.names {
        let name = policy.metadata.name.as_deref().unwrap_or("");
        return names.iter().any(|n| n == name);
    }

    if let Some(match_labels) = &selector.match_labels {
        let labels = policy.metadata.labels.clone().unwrap_or_default();
        return match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v));
    }

    true
}

fn install_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = signal::ctrl_c();

        #[cfg(unix)]
        {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = term.recv() => {}
                    }
                }
                Err(e) => {
                    warn!(error = %e, "sigterm_handler_unavailable");
                    let _ = ctrl_c.await;
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }

        shutdown.cancel();
    });
}

async fn patch_terminal(
    api: &Api<ReindexJob>,
    name: &str,
    phase: ReindexPhase,
    message: &str,
    progress: Option<&ReindexProgress>,
) {
    let mut status = serde_json::json!({
        "phase": phase.to_string(),
        "completedAt": Utc::now().to_rfc3339(),
        "message": message,
    });
    if let Some(progress) = progress {
        status["progress"] = serde_json::to_value(progress).unwrap_or_default();
    }

    if let Err(e) = api
        .patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&serde_json::json!({ "status": status })),
        )
        .await
    {
        warn!(job = %name, error = %e, "terminal_status_update_failed");
    }
}

async fn fail_job(api: &Api<ReindexJob>, name: &str, message: &str) {
    patch_terminal(api, name, ReindexPhase::Failed, message, None).await;
}

/* ============================= TESTS ============================= */
