use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use kube::api::{Api, ListParams};
use kube::Client;
use prometheus::{Encoder, TextEncoder};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli::NatsArgs;
use kube_activity::activity::OriginType;
use kube_activity::broker::{
    self, AUDIT_STREAM, BrokerHealth, DLQ_SUBJECT_PREFIX, EVENT_STREAM,
};
use kube_activity::cache::{PolicyCache, run_policy_watcher};
use kube_activity::consumer::{ConsumerConfig, ProcessorMetrics, spawn_workers};
use kube_activity::crd::ActivityPolicy;
use kube_activity::dlq::{DeadLetterSink, JetStreamDeadLetterSink, NoopDeadLetterSink};
use kube_activity::resolve::{DiscoveryKindResolver, KindResolver, StaticKindResolver};

/* ============================= ENTRY ============================= */

#[allow(clippy::too_many_arguments)]
pub async fn run(
    nats: &NatsArgs,
    workers: usize,
    batch_size: usize,
    audit_consumer_name: &str,
    event_consumer_name: &str,
    disable_dlq: bool,
) -> Result<()> {
    println!("Starting activity processor...\n");

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

    // kind resolver: discovery snapshot, with the static table as the
    // degraded mode
    print!("  API discovery ............... ");
    let resolver: Arc<dyn KindResolver> =
        match DiscoveryKindResolver::from_cluster(client.clone()).await {
            Ok(resolver) => {
                println!("OK");
                Arc::new(resolver)
            }
            Err(e) => {
                println!("DEGRADED (built-in table only: {e})");
                warn!(error = %e, "discovery_failed_using_builtin_resolver");
                Arc::new(StaticKindResolver::builtin())
            }
        };

    // policy cache, seeded before the consumers start
    print!("  Policy cache ................ ");
    let cache = Arc::new(PolicyCache::new(resolver));
    let policies: Api<ActivityPolicy> = Api::all(client.clone());
    let initial = policies
        .list(&ListParams::default())
        .await
        .context("Cannot list ActivityPolicy objects. Is the CRD installed?")?;
    cache.resync(&initial.items);
    println!("OK ({} policies installed)", cache.len());

    // broker
    print!("  Broker connection ........... ");
    let shutdown = CancellationToken::new();
    let health = BrokerHealth::new();
    let nats_client = broker::connect(&nats.nats_url, health.clone(), shutdown.clone())
        .await
        .context("Failed to connect to the broker")?;
    println!("OK ({})", nats.nats_url);

    let js = async_nats::jetstream::new(nats_client.clone());

    print!("  Broker streams .............. ");
    broker::ensure_streams(&js).await?;
    println!("OK");

    print!("  Pull consumers .............. ");
    let audit_consumer = broker::pull_consumer(&js, AUDIT_STREAM, audit_consumer_name).await?;
    let event_consumer = broker::pull_consumer(&js, EVENT_STREAM, event_consumer_name).await?;
    println!("OK ({audit_consumer_name}, {event_consumer_name})");

    let dlq: Arc<dyn DeadLetterSink> = if disable_dlq {
        Arc::new(NoopDeadLetterSink)
    } else {
        Arc::new(JetStreamDeadLetterSink::new(js.clone(), DLQ_SUBJECT_PREFIX))
    };

    let metrics = Arc::new(ProcessorMetrics::new());
    let config = ConsumerConfig {
        workers,
        batch_size,
        fetch_timeout: Duration::from_secs(5),
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], 8080));

    println!("  Workers ..................... {workers} per pipeline");
    println!("  Batch size .................. {batch_size}");
    println!(
        "  Dead letter ................. {}",
        if disable_dlq { "disabled" } else { "enabled" }
    );
    println!("  HTTP server ................. http://{addr}");
    println!();
    println!("  Available endpoints:");
    println!("    GET /healthz .............. Liveness probe (always 200 OK)");
    println!("    GET /readyz ............... Readiness probe (503 while broker is down)");
    println!("    GET /metrics .............. Prometheus metrics scrape endpoint");
    println!();
    println!("Processor running. Press Ctrl+C to stop.\n");
    println!("{}", "=".repeat(70));

    info!("processor_started");

    // policy watcher keeps the cache current
    let watcher_client = client.clone();
    let watcher_cache = cache.clone();
    let watcher_shutdown = shutdown.clone();
    let watcher_handle = tokio::spawn(async move {
        if let Err(e) = run_policy_watcher(watcher_client, watcher_cache, watcher_shutdown).await {
            warn!(error = %e, "policy_watcher_failed");
        }
    });

    // metrics / health server
    let http_health = health.clone();
    let http_shutdown = shutdown.clone();
    let http_handle =
        tokio::spawn(async move { serve_http(http_health, http_shutdown, addr).await });

    // the two consumer pools
    let mut worker_handles = spawn_workers(
        OriginType::Audit,
        js.clone(),
        audit_consumer,
        cache.clone(),
        dlq.clone(),
        metrics.clone(),
        config.clone(),
        shutdown.clone(),
    );
    worker_handles.extend(spawn_workers(
        OriginType::Event,
        js.clone(),
        event_consumer,
        cache.clone(),
        dlq.clone(),
        metrics.clone(),
        config,
        shutdown.clone(),
    ));

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("shutdown_signal_received");
            println!("\n{}", "=".repeat(70));
            println!("Shutdown signal received. Stopping processor...");
            println!("{}", "=".repeat(70));
        }
        _ = shutdown.cancelled() => {
            // lame-duck from the broker lands here
            info!("shutdown_requested_by_broker");
            println!("\nBroker entered lame-duck mode. Stopping processor...");
        }
    }

    shutdown.cancel();

    // in-flight batches finish and ack before the workers return
    for handle in worker_handles {
        let _ = handle.await;
    }
    let _ = watcher_handle.await;

    broker::drain(nats_client).await;
    let _ = http_handle.await;

    info!("processor_stopped");
    println!("Processor stopped.");
    Ok(())
}

/* ============================= HTTP SERVER ============================= */

pub(crate) fn build_processor_router(health: BrokerHealth) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route(
            "/readyz",
            get({
                let health = health.clone();
                move || ready_handler(health.clone())
            }),
        )
}

async fn serve_http(
    health: BrokerHealth,
    shutdown: CancellationToken,
    addr: SocketAddr,
) -> Result<()> {
    let app = build_processor_router(health);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind metrics server on :8080")?;

    info!(addr = %addr, "processor_http_server_started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
        })
        .await?;

    Ok(())
}

async fn ready_handler(health: BrokerHealth) -> impl IntoResponse {
    if health.is_connected() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = ProcessorMetrics::registry().gather();
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
