use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{Context as AnyhowContext, Result};
use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::{Action, Controller};
use kube::{Client, ResourceExt};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder};
use tokio::signal;
use tokio::sync::{Mutex, broadcast};
use tracing::{info, warn};

use crate::cli::{NatsArgs, StoreArgs};
use kube_activity::crd::{
    ActivityPolicy, CONDITION_READY, Condition, ReindexJob, ReindexPhase,
};
use kube_activity::policy::compile_policy;
use kube_activity::store::{ActivityStore, StoreConfig};

/* ============================= CONFIG ============================= */

const FIELD_MANAGER: &str = "kube-activity-reconciler";
const REQUEUE_INTERVAL: Duration = Duration::from_secs(30);
const PENDING_BACKOFF: Duration = Duration::from_secs(15);

const LABEL_COMPONENT: &str = "app.kubernetes.io/component";
const LABEL_REINDEX_JOB: &str = "activity.platform.io/reindex-job";
const WORKER_COMPONENT: &str = "reindex-worker";

const CONDITION_POLICIES_VALIDATED: &str = "PoliciesValidated";
const CONDITION_SYSTEM_READY: &str = "SystemReady";

/* ============================= PROMETHEUS ============================= */

static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILE_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new(
            "activity_reconcile_total",
            "Reconciliation cycles per controller",
        ),
        &["controller"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static RECONCILE_ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new(
            "activity_reconcile_errors_total",
            "Reconciliation errors per controller",
        ),
        &["controller"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static POLICIES_READY: LazyLock<IntGauge> = LazyLock::new(|| {
    let g = IntGauge::new(
        "activity_policies_ready",
        "ActivityPolicy objects currently carrying Ready=True",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(g.clone()))
        .expect("metric not yet registered");
    g
});

static WORKERS_LAUNCHED: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "activity_reindex_workers_launched_total",
        "Re-index worker Jobs created",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static JOBS_FINISHED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new(
            "activity_reindex_jobs_finished_total",
            "ReindexJob objects that reached a terminal phase",
        ),
        &["phase"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

/* ============================= STATE & CONTEXT ============================= */

pub(crate) struct ReconcileState {
    pub(crate) ready: bool,
}

struct Ctx {
    client: Client,
    worker_image: String,
    worker_namespace: String,
    max_concurrent: usize,
    nats: NatsArgs,
    store: StoreArgs,
}

/* ============================= ENTRY ============================= */

pub async fn run(
    nats: &NatsArgs,
    store: &StoreArgs,
    worker_image: &str,
    worker_namespace: &str,
    max_concurrent: usize,
) -> Result<()> {
    println!("Starting activity reconciler...\n");

    let client = Client::try_default()
        .await
        .context("Failed to load kubeconfig")?;

    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach cluster: {}. Is the cluster running?", e);
        }
    }

    let policies: Api<ActivityPolicy> = Api::all(client.clone());
    let jobs: Api<ReindexJob> = Api::all(client.clone());
    let workers: Api<Job> = Api::namespaced(client.clone(), worker_namespace);

    if let Err(e) = jobs.list(&ListParams::default().limit(1)).await {
        anyhow::bail!("CRDs are not queryable ({e}). Install with: kube-activity crd install");
    }

    let ctx = Arc::new(Ctx {
        client: client.clone(),
        worker_image: worker_image.to_string(),
        worker_namespace: worker_namespace.to_string(),
        max_concurrent,
        nats: nats.clone(),
        store: store.clone(),
    });

    LazyLock::force(&RECONCILE_TOTAL);
    LazyLock::force(&RECONCILE_ERRORS);
    LazyLock::force(&POLICIES_READY);
    LazyLock::force(&WORKERS_LAUNCHED);
    LazyLock::force(&JOBS_FINISHED);

    let addr = SocketAddr::from(([0, 0, 0, 0], 9090));

    println!("  CRD watch ................... ActivityPolicy, ReindexJob (activity.platform.io/v1alpha1)");
    println!("  Worker image ................ {worker_image}");
    println!("  Worker namespace ............ {worker_namespace}");
    println!("  Concurrency limit ........... {max_concurrent}");
    println!("  Metrics server .............. http://{addr}");
    println!();
    println!("Reconciler running. Press Ctrl+C to stop.\n");
    println!("{}", "=".repeat(70));

    info!("reconciler_started");

    let state = Arc::new(Mutex::new(ReconcileState { ready: false }));
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let http_state = state.clone();
    let http_shutdown = shutdown_tx.subscribe();
    let http_handle =
        tokio::spawn(async move { serve_http(http_state, http_shutdown, addr).await });

    let policy_state = state.clone();
    let policy_controller = Controller::new(policies, Default::default())
        .run(reconcile_policy, policy_error_policy, ctx.clone())
        .for_each(move |result| {
            let state = policy_state.clone();
            async move {
                {
                    let mut s = state.lock().await;
                    if !s.ready {
                        s.ready = true;
                    }
                }
                if let Err(e) = result {
                    warn!(error = %e, "policy_reconcile_dispatch_error");
                }
            }
        });

    let reindex_controller = Controller::new(jobs, Default::default())
        .owns(workers, Default::default())
        .run(reconcile_reindex, reindex_error_policy, ctx.clone())
        .for_each(|result| async move {
            if let Err(e) = result {
                warn!(error = %e, "reindex_reconcile_dispatch_error");
            }
        });

    // dropping the controller streams is the only way to stop them
    tokio::select! {
        _ = futures::future::join(policy_controller, reindex_controller) => {
            info!("controller_streams_ended");
            println!("\nController streams ended unexpectedly.");
        }
        _ = signal::ctrl_c() => {
            info!("shutdown_signal_received");
            println!("\n{}", "=".repeat(70));
            println!("Shutdown signal received. Stopping reconciler...");
            println!("{}", "=".repeat(70));
        }
    }

    let _ = shutdown_tx.send(());
    let _ = http_handle.await?;

    info!("reconciler_stopped");
    println!("Reconciler stopped.");
    Ok(())
}

/* ============================= POLICY RECONCILE ============================= */

/// Compile every expression of the policy and publish the outcome as the
/// `Ready` condition. Only `Ready=True` policies enter the matching index.
async fn reconcile_policy(
    policy: Arc<ActivityPolicy>,
    ctx: Arc<Ctx>,
) -> std::result::Result<Action, kube::Error> {
    let name = policy.name_any();
    let generation = policy.metadata.generation;

    let already_reconciled =
        policy.status.as_ref().and_then(|s| s.observed_generation) == generation;
    if already_reconciled {
        return Ok(Action::requeue(Duration::from_secs(300)));
    }

    RECONCILE_TOTAL.with_label_values(&["policy"]).inc();

    let condition = match compile_policy(&policy) {
        Ok(compiled) => {
            info!(
                policy = %name,
                audit_rules = compiled.audit_rules.len(),
                event_rules = compiled.event_rules.len(),
                "policy_expressions_valid"
            );
            Condition::new(CONDITION_READY, true, "ExpressionsValid", "")
        }
        Err(err) => {
            warn!(policy = %name, error = %err, "policy_compile_failed");
            Condition::new(CONDITION_READY, false, "CompileError", &err.to_string())
        }
    };

    let status = serde_json::json!({
        "status": {
            "observedGeneration": generation,
            "conditions": [condition],
        }
    });

    let api: Api<ActivityPolicy> = Api::all(ctx.client.clone());
    api.patch_status(
        &name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&status),
    )
    .await?;

    refresh_ready_gauge(&api).await;

    Ok(Action::requeue(Duration::from_secs(300)))
}

async fn refresh_ready_gauge(api: &Api<ActivityPolicy>) {
    if let Ok(list) = api.list(&ListParams::default()).await {
        let ready = list.items.iter().filter(|p| p.is_ready()).count();
        POLICIES_READY.set(ready as i64);
    }
}

fn policy_error_policy(
    _policy: Arc<ActivityPolicy>,
    error: &kube::Error,
    _ctx: Arc<Ctx>,
) -> Action {
    RECONCILE_ERRORS.with_label_values(&["policy"]).inc();
    warn!(error = %error, "policy_reconcile_error");
    Action::requeue(Duration::from_secs(60))
}

/* ============================= REINDEX RECONCILE ============================= */

async fn reconcile_reindex(
    job: Arc<ReindexJob>,
    ctx: Arc<Ctx>,
) -> std::result::Result<Action, kube::Error> {
    let name = job.name_any();
    RECONCILE_TOTAL.with_label_values(&["reindex"]).inc();

    match job.phase() {
        // terminal phases never transition further; only the worker GC runs
        ReindexPhase::Succeeded | ReindexPhase::Failed => {
            handle_terminal(&job, &ctx).await
        }
        ReindexPhase::Running => handle_running(&job, &ctx).await,
        ReindexPhase::Pending => handle_pending(&name, &job, &ctx).await,
    }
}

async fn handle_pending(
    name: &str,
    job: &ReindexJob,
    ctx: &Ctx,
) -> std::result::Result<Action, kube::Error> {
    let jobs_api: Api<ReindexJob> = Api::all(ctx.client.clone());

    // asynchronous validations surface as conditions, not admission denials
    let mut conditions = vec![validate_policies_condition(ctx, job).await];
    conditions.push(system_ready_condition(ctx).await);

    // the concurrency gate is derived from live worker Jobs, never held
    let workers_api: Api<Job> = Api::namespaced(ctx.client.clone(), &ctx.worker_namespace);
    let selector = format!("{LABEL_COMPONENT}={WORKER_COMPONENT}");
    let worker_list = workers_api
        .list(&ListParams::default().labels(&selector))
        .await?;
    let active = worker_list.items.iter().filter(|j| is_active_worker(j)).count();

    if active >= ctx.max_concurrent {
        info!(job = %name, active, limit = ctx.max_concurrent, "reindex_job_queued");
        patch_status(
            &jobs_api,
            name,
            serde_json::json!({
                "conditions": conditions,
                "message": format!("waiting: {active} re-index worker(s) already running"),
            }),
        )
        .await?;
        return Ok(Action::requeue(PENDING_BACKOFF));
    }

    // a worker left over from a restarted run blocks the name; replace it
    let worker_name = worker_job_name(name);
    if workers_api.get_opt(&worker_name).await?.is_some() {
        info!(job = %name, worker = %worker_name, "stale_worker_replaced");
        let _ = workers_api
            .delete(&worker_name, &DeleteParams::background())
            .await;
        return Ok(Action::requeue(Duration::from_secs(5)));
    }

    // the worker does not re-derive startedAt; it must be on the ledger
    // before the worker exists
    patch_status(
        &jobs_api,
        name,
        serde_json::json!({
            "startedAt": Utc::now().to_rfc3339(),
            "conditions": conditions,
            "message": "launching re-index worker",
        }),
    )
    .await?;

    let worker = build_worker_job(job, &ctx.worker_image, &ctx.worker_namespace, &ctx.nats, &ctx.store);
    workers_api.create(&PostParams::default(), &worker).await?;
    WORKERS_LAUNCHED.inc();

    info!(job = %name, worker = %worker_name, "reindex_worker_launched");
    println!(
        "[{}] reindex/{name}: worker {worker_name} launched",
        Utc::now().format("%H:%M:%S")
    );

    patch_status(
        &jobs_api,
        name,
        serde_json::json!({
            "phase": "Running",
            "message": "re-index worker launched",
        }),
    )
    .await?;

    Ok(Action::requeue(REQUEUE_INTERVAL))
}

async fn handle_running(
    job: &ReindexJob,
    ctx: &Ctx,
) -> std::result::Result<Action, kube::Error> {
    let name = job.name_any();
    let jobs_api: Api<ReindexJob> = Api::all(ctx.client.clone());
    let workers_api: Api<Job> = Api::namespaced(ctx.client.clone(), &ctx.worker_namespace);

    let worker = workers_api.get_opt(&worker_job_name(&name)).await?;

    match worker {
        None => {
            warn!(job = %name, "reindex_worker_missing");
            JOBS_FINISHED.with_label_values(&["Failed"]).inc();
            patch_status(
                &jobs_api,
                &name,
                serde_json::json!({
                    "phase": "Failed",
                    "completedAt": Utc::now().to_rfc3339(),
                    "message": "worker Job disappeared before completion",
                }),
            )
            .await?;
            Ok(Action::await_change())
        }
        Some(worker) => {
            let status = worker.status.as_ref();
            let succeeded = status.and_then(|s| s.succeeded).unwrap_or(0);
            let failed = status.and_then(|s| s.failed).unwrap_or(0);

            if succeeded > 0 {
                // the worker normally records its own terminal phase; this
                // path covers a lost final status update
                JOBS_FINISHED.with_label_values(&["Succeeded"]).inc();
                patch_status(
                    &jobs_api,
                    &name,
                    serde_json::json!({
                        "phase": "Succeeded",
                        "completedAt": Utc::now().to_rfc3339(),
                        "message": "re-index completed",
                    }),
                )
                .await?;
                Ok(Action::requeue(REQUEUE_INTERVAL))
            } else if failed > 0 {
                warn!(job = %name, "reindex_worker_failed");
                JOBS_FINISHED.with_label_values(&["Failed"]).inc();
                patch_status(
                    &jobs_api,
                    &name,
                    serde_json::json!({
                        "phase": "Failed",
                        "completedAt": Utc::now().to_rfc3339(),
                        "message": "worker process failed; inspect the worker Job logs",
                    }),
                )
                .await?;
                Ok(Action::requeue(REQUEUE_INTERVAL))
            } else {
                Ok(Action::requeue(REQUEUE_INTERVAL))
            }
        }
    }
}

async fn handle_terminal(
    job: &ReindexJob,
    ctx: &Ctx,
) -> std::result::Result<Action, kube::Error> {
    let name = job.name_any();

    let Some(ttl) = job.spec.ttl_seconds_after_finished else {
        // no TTL: the worker Job is kept for inspection
        return Ok(Action::await_change());
    };

    let completed_at = job
        .status
        .as_ref()
        .and_then(|s| s.completed_at.as_deref())
        .and_then(kube_activity::crd::parse_rfc3339);

    let Some(completed_at) = completed_at else {
        return Ok(Action::await_change());
    };

    let elapsed = Utc::now().signed_duration_since(completed_at).num_seconds();
    if elapsed < ttl {
        let remaining = (ttl - elapsed).max(1) as u64;
        return Ok(Action::requeue(Duration::from_secs(remaining)));
    }

    let workers_api: Api<Job> = Api::namespaced(ctx.client.clone(), &ctx.worker_namespace);
    let worker_name = worker_job_name(&name);
    match workers_api
        .delete(&worker_name, &DeleteParams::background())
        .await
    {
        Ok(_) => info!(job = %name, worker = %worker_name, "worker_garbage_collected"),
        Err(kube::Error::Api(err)) if err.code == 404 => {}
        Err(e) => warn!(job = %name, error = %e, "worker_gc_failed"),
    }

    Ok(Action::await_change())
}

fn reindex_error_policy(
    _job: Arc<ReindexJob>,
    error: &kube::Error,
    _ctx: Arc<Ctx>,
) -> Action {
    RECONCILE_ERRORS.with_label_values(&["reindex"]).inc();
    warn!(error = %error, "reindex_reconcile_error");
    Action::requeue(Duration::from_secs(60))
}

/* ============================= VALIDATION CONDITIONS ============================= */

async fn validate_policies_condition(ctx: &Ctx, job: &ReindexJob) -> Condition {
    let Some(selector) = &job.spec.policy_selector else {
        return Condition::new(CONDITION_POLICIES_VALIDATED, true, "AllPolicies", "");
    };
    let Some(names) = &selector.names else {
        return Condition::new(CONDITION_POLICIES_VALIDATED, true, "SelectorAccepted", "");
    };

    let api: Api<ActivityPolicy> = Api::all(ctx.client.clone());
    let mut missing = Vec::new();
    for name in names {
        match api.get_opt(name).await {
            Ok(Some(policy)) if policy.is_ready() => {}
            Ok(Some(_)) => missing.push(format!("{name} (not Ready)")),
            Ok(None) => missing.push(format!("{name} (not found)")),
            Err(e) => missing.push(format!("{name} ({e})")),
        }
    }

    if missing.is_empty() {
        Condition::new(CONDITION_POLICIES_VALIDATED, true, "PoliciesExist", "")
    } else {
        Condition::new(
            CONDITION_POLICIES_VALIDATED,
            false,
            "PoliciesMissing",
            &missing.join(", "),
        )
    }
}

async fn system_ready_condition(ctx: &Ctx) -> Condition {
    let store = ActivityStore::connect(&StoreConfig {
        url: ctx.store.clickhouse_url.clone(),
        database: ctx.store.clickhouse_database.clone(),
        user: ctx.store.clickhouse_user.clone(),
        password: ctx.store.clickhouse_password.clone(),
    });

    match tokio::time::timeout(Duration::from_secs(5), store.ping()).await {
        Ok(Ok(())) => Condition::new(CONDITION_SYSTEM_READY, true, "StoreReachable", ""),
        Ok(Err(e)) => Condition::new(CONDITION_SYSTEM_READY, false, "StoreUnreachable", &e.to_string()),
        Err(_) => Condition::new(
            CONDITION_SYSTEM_READY,
            false,
            "StoreUnreachable",
            "ping timed out after 5s",
        ),
    }
}

/* ============================= WORKER JOB ============================= */

pub(crate) fn worker_job_name(job_name: &str) -> String {
    format!("reindex-{job_name}")
}

/// A worker is active while it has no completion time and has not failed.
pub(crate) fn is_active_worker(job: &Job) -> bool {
    let Some(status) = &job.status else {
        return true;
    };
    status.completion_time.is_none() && status.failed.unwrap_or(0) == 0
}

/// Materialize the child worker process for a Pending job.
///
/// The worker holds no authoritative state; the ReindexJob object is the
/// ledger, so everything the worker needs arrives as arguments and env.
pub(crate) fn build_worker_job(
    job: &ReindexJob,
    image: &str,
    namespace: &str,
    nats: &NatsArgs,
    store: &StoreArgs,
) -> Job {
    let name = job.name_any();
    let labels = std::collections::BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), "kube-activity".to_string()),
        (LABEL_COMPONENT.to_string(), WORKER_COMPONENT.to_string()),
        (LABEL_REINDEX_JOB.to_string(), name.clone()),
    ]);

    let mut env = vec![
        EnvVar {
            name: "NATS_URL".to_string(),
            value: Some(nats.nats_url.clone()),
            ..Default::default()
        },
        EnvVar {
            name: "CLICKHOUSE_URL".to_string(),
            value: Some(store.clickhouse_url.clone()),
            ..Default::default()
        },
        EnvVar {
            name: "CLICKHOUSE_DATABASE".to_string(),
            value: Some(store.clickhouse_database.clone()),
            ..Default::default()
        },
    ];
    if let Some(user) = &store.clickhouse_user {
        env.push(EnvVar {
            name: "CLICKHOUSE_USER".to_string(),
            value: Some(user.clone()),
            ..Default::default()
        });
    }
    if let Some(password) = &store.clickhouse_password {
        env.push(EnvVar {
            name: "CLICKHOUSE_PASSWORD".to_string(),
            value: Some(password.clone()),
            ..Default::default()
        });
    }

    let owner = OwnerReference {
        api_version: "activity.platform.io/v1alpha1".to_string(),
        kind: "ReindexJob".to_string(),
        name: name.clone(),
        uid: job.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        ..Default::default()
    };

    Job {
        metadata: ObjectMeta {
            name: Some(worker_job_name(&name)),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    containers: vec![Container {
                        name: WORKER_COMPONENT.to_string(),
                        image: Some(image.to_string()),
                        args: Some(vec![
                            "reindex-worker".to_string(),
                            "--job".to_string(),
                            name,
                        ]),
                        env: Some(env),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

async fn patch_status(
    api: &Api<ReindexJob>,
    name: &str,
    status: serde_json::Value,
) -> std::result::Result<(), kube::Error> {
    api.patch_status(
        name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&serde_json::json!({ "status": status })),
    )
    .await?;
    Ok(())
}

/* ============================= HTTP SERVER ============================= */

pub(crate) fn build_reconcile_router(state: Arc<Mutex<ReconcileState>>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route(
            "/readyz",
            get({
                let state = state.clone();
                move || ready_handler(state.clone())
            }),
        )
}

async fn serve_http(
    state: Arc<Mutex<ReconcileState>>,
    mut shutdown: broadcast::Receiver<()>,
    addr: SocketAddr,
) -> Result<()> {
    let app = build_reconcile_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind metrics server on :9090")?;

    info!(addr = %addr, "reconciler_http_server_started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}

async fn ready_handler(state: Arc<Mutex<ReconcileState>>) -> impl IntoResponse {
    let state = state.lock().await;
    if state.ready {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => match String::from_utf8(buffer) {
            Ok(body) => (StatusCode::OK, body),
            Err(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "metrics encoding error".to_string(),
            ),
        },
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "metrics encoding error".to_string(),
        ),
    }
}

/* ============================= TESTS ============================= */
