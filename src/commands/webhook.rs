use std::net::SocketAddr;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use chrono::Utc;
use prometheus::{Encoder, Histogram, IntCounterVec, Registry, TextEncoder};
use tokio::sync::broadcast;
use tracing::info;

use kube_activity::admission::{
    AdmissionVerdict, validate_policy, validate_reindex_create, validate_reindex_update,
};
use kube_activity::crd::{ActivityPolicy, ReindexJob};

/* ============================= PROMETHEUS ============================= */

static WEBHOOK_REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static WEBHOOK_REQUESTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new("webhook_requests_total", "Total admission webhook requests"),
        &["kind", "operation", "allowed"],
    )
    .expect("metric definition is valid");
    WEBHOOK_REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static WEBHOOK_DENIALS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new("webhook_denials_total", "Total admission webhook denials"),
        &["kind"],
    )
    .expect("metric definition is valid");
    WEBHOOK_REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static WEBHOOK_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    let h = Histogram::with_opts(prometheus::HistogramOpts::new(
        "webhook_request_duration_seconds",
        "Duration of admission webhook request processing in seconds",
    ))
    .expect("metric definition is valid");
    WEBHOOK_REGISTRY
        .register(Box::new(h.clone()))
        .expect("metric not yet registered");
    h
});

/* ============================= ENTRY: SERVE ============================= */

pub async fn serve(addr_str: &str, tls_cert: &str, tls_key: &str) -> Result<()> {
    println!("Starting admission webhook server...\n");
    info!("webhook_starting");

    print!("  TLS ......................... ");
    validate_tls_files(tls_cert, tls_key)?;
    println!("loaded ({tls_cert}, {tls_key})");

    let addr: SocketAddr = addr_str.parse().context("Invalid address format")?;

    println!("  HTTPS server ................ https://{addr}");
    println!();
    println!("  Validating: ReindexJob (shape + immutability), ActivityPolicy (expressions)");
    println!();
    println!("  Available endpoints:");
    println!("    POST /validate ............ Admission review handler");
    println!("    GET  /healthz ............. Liveness probe");
    println!("    GET  /metrics ............. Prometheus metrics");
    println!();
    println!("Admission webhook running. Press Ctrl+C to stop.\n");
    println!("{}", "=".repeat(70));

    let tls_cert = tls_cert.to_string();
    let tls_key = tls_key.to_string();

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let http_shutdown = shutdown_tx.subscribe();

    let http_handle = tokio::spawn(async move {
        start_https_server(http_shutdown, addr, &tls_cert, &tls_key).await
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown_signal_received");
    println!("\n{}", "=".repeat(70));
    println!("Shutdown signal received. Stopping webhook server...");
    println!("{}", "=".repeat(70));

    let _ = shutdown_tx.send(());
    let _ = http_handle.await?;

    info!("webhook_stopped");
    println!("Webhook server stopped.");
    Ok(())
}

fn validate_tls_files(cert_path: &str, key_path: &str) -> Result<()> {
    if !std::path::Path::new(cert_path).exists() {
        anyhow::bail!("TLS certificate file not found: {}", cert_path);
    }
    if !std::path::Path::new(key_path).exists() {
        anyhow::bail!("TLS key file not found: {}", key_path);
    }
    Ok(())
}

/* ============================= HTTPS SERVER ============================= */

pub(crate) fn build_webhook_router() -> Router {
    Router::new()
        .route("/validate", post(admission_handler))
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route("/metrics", get(webhook_metrics_handler))
}

async fn start_https_server(
    mut shutdown: broadcast::Receiver<()>,
    addr: SocketAddr,
    tls_cert: &str,
    tls_key: &str,
) -> Result<()> {
    let app = build_webhook_router();

    let rustls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(tls_cert, tls_key)
        .await
        .context("Failed to load TLS configuration")?;

    info!(addr = %addr, "https_server_started");

    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();

    tokio::spawn(async move {
        let _ = shutdown.recv().await;
        shutdown_handle.graceful_shutdown(Some(std::time::Duration::from_secs(5)));
    });

    axum_server::bind_rustls(addr, rustls_config)
        .handle(handle)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}

async fn webhook_metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = WEBHOOK_REGISTRY.gather();
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

/* ============================= ADMISSION HANDLER ============================= */

async fn admission_handler(body: String) -> impl IntoResponse {
    let _timer = WEBHOOK_DURATION.start_timer();

    let review: serde_json::Value = match serde_json::from_str(&body) {
        Ok(v) => v,
        Err(e) => {
            info!(error = %e, "invalid_admission_review");
            return (StatusCode::BAD_REQUEST, build_admission_response("", true, None));
        }
    };

    let request = &review["request"];
    let uid = request["uid"].as_str().unwrap_or("").to_string();
    let operation = request["operation"].as_str().unwrap_or("UNKNOWN").to_string();
    let kind = request["kind"]["kind"].as_str().unwrap_or("").to_string();

    let verdict = review_request(&kind, &operation, request);

    let allowed_str = if verdict.allowed { "true" } else { "false" };
    WEBHOOK_REQUESTS
        .with_label_values(&[&kind, &operation, allowed_str])
        .inc();

    if !verdict.allowed {
        WEBHOOK_DENIALS.with_label_values(&[&kind]).inc();
        info!(
            kind = %kind,
            operation = %operation,
            violations = ?verdict.violations,
            "admission_denied"
        );
    }

    (
        StatusCode::OK,
        build_admission_response(&uid, verdict.allowed, verdict.message.as_deref()),
    )
}

/// Route the request to the matching validator.
///
/// Unknown kinds and unparseable objects fail open; this webhook must never
/// wedge unrelated API traffic.
pub(crate) fn review_request(
    kind: &str,
    operation: &str,
    request: &serde_json::Value,
) -> AdmissionVerdict {
    let allow = AdmissionVerdict {
        allowed: true,
        message: None,
        violations: Vec::new(),
    };

    match (kind, operation) {
        ("ReindexJob", "CREATE") => {
            match serde_json::from_value::<ReindexJob>(request["object"].clone()) {
                Ok(job) => validate_reindex_create(&job, Utc::now()),
                Err(e) => {
                    info!(error = %e, "reindex_job_parse_failed_failopen");
                    allow
                }
            }
        }
        ("ReindexJob", "UPDATE") => {
            let old = serde_json::from_value::<ReindexJob>(request["oldObject"].clone());
            let new = serde_json::from_value::<ReindexJob>(request["object"].clone());
            match (old, new) {
                (Ok(old), Ok(new)) => validate_reindex_update(&old, &new),
                (old, new) => {
                    info!(
                        old_err = old.is_err(),
                        new_err = new.is_err(),
                        "reindex_job_update_parse_failed_failopen"
                    );
                    allow
                }
            }
        }
        ("ActivityPolicy", "CREATE") | ("ActivityPolicy", "UPDATE") => {
            match serde_json::from_value::<ActivityPolicy>(request["object"].clone()) {
                Ok(policy) => validate_policy(&policy),
                Err(e) => {
                    info!(error = %e, "activity_policy_parse_failed_failopen");
                    allow
                }
            }
        }
        _ => allow,
    }
}

pub(crate) fn build_admission_response(uid: &str, allowed: bool, message: Option<&str>) -> String {
    let mut response = serde_json::json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "response": {
            "uid": uid,
            "allowed": allowed
        }
    });

    if let Some(msg) = message {
        response["response"]["status"] = serde_json::json!({ "message": msg });
    }

    response.to_string()
}

/* ============================= CERT GENERATION ============================= */

pub fn generate_certs(service_name: &str, namespace: &str, output_dir: &str) -> Result<()> {
    println!("Generating self-signed TLS certificates...\n");

    let (ca_pem, cert_pem, key_pem) = generate_self_signed_certs(service_name, namespace)?;

    let output_path = std::path::Path::new(output_dir);
    if !output_path.exists() {
        std::fs::create_dir_all(output_path).context("Failed to create output directory")?;
    }

    let ca_path = output_path.join("ca.crt");
    let cert_path = output_path.join("tls.crt");
    let key_path = output_path.join("tls.key");

    std::fs::write(&ca_path, &ca_pem).context("Failed to write ca.crt")?;
    std::fs::write(&cert_path, &cert_pem).context("Failed to write tls.crt")?;
    std::fs::write(&key_path, &key_pem).context("Failed to write tls.key")?;

    println!("  CA certificate .............. {}", ca_path.display());
    println!("  Server certificate .......... {}", cert_path.display());
    println!("  Server key .................. {}", key_path.display());
    println!();
    println!("  SANs:");
    println!("    - {service_name}.{namespace}.svc");
    println!("    - {service_name}.{namespace}.svc.cluster.local");
    println!();
    println!("TLS certificates generated successfully.");

    Ok(())
}

pub fn generate_self_signed_certs(
    service_name: &str,
    namespace: &str,
) -> Result<(String, String, String)> {
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};

    let mut ca_params = CertificateParams::default();
    ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    let mut ca_dn = DistinguishedName::new();
    ca_dn.push(DnType::CommonName, "kube-activity-webhook-ca");
    ca_dn.push(DnType::OrganizationName, "kube-activity");
    ca_params.distinguished_name = ca_dn;

    let ca_key = KeyPair::generate().context("Failed to generate CA key pair")?;
    let ca_cert = ca_params
        .self_signed(&ca_key)
        .context("Failed to self-sign CA certificate")?;

    let mut server_params = CertificateParams::default();
    let mut server_dn = DistinguishedName::new();
    server_dn.push(DnType::CommonName, format!("{service_name}.{namespace}.svc"));
    server_params.distinguished_name = server_dn;
    server_params.subject_alt_names = vec![
        SanType::DnsName(
            format!("{service_name}.{namespace}.svc")
                .try_into()
                .context("Invalid DNS name for SAN")?,
        ),
        SanType::DnsName(
            format!("{service_name}.{namespace}.svc.cluster.local")
                .try_into()
                .context("Invalid DNS name for SAN")?,
        ),
    ];

    let server_key = KeyPair::generate().context("Failed to generate server key pair")?;
    let server_cert = server_params
        .signed_by(&server_key, &ca_cert, &ca_key)
        .context("Failed to sign server certificate")?;

    Ok((ca_cert.pem(), server_cert.pem(), server_key.serialize_pem()))
}

/* ============================= INSTALL CONFIG ============================= */

pub fn install_config(service_name: &str, namespace: &str, ca_bundle_path: &str) -> Result<()> {
    use base64::Engine;

    let ca_bytes = std::fs::read(ca_bundle_path).context("Failed to read CA bundle file")?;
    let ca_b64 = base64::engine::general_purpose::STANDARD.encode(&ca_bytes);

    let yaml = format!(
        r#"apiVersion: admissionregistration.k8s.io/v1
kind: ValidatingWebhookConfiguration
metadata:
  name: {service_name}
webhooks:
  - name: validate.activity.platform.io
    rules:
      - apiGroups: ["activity.platform.io"]
        resources: ["activitypolicies", "reindexjobs"]
        apiVersions: ["v1alpha1"]
        operations: ["CREATE", "UPDATE"]
    clientConfig:
      service:
        name: {service_name}
        namespace: {namespace}
        path: /validate
      caBundle: {ca_b64}
    failurePolicy: Fail
    sideEffects: None
    admissionReviewVersions: ["v1"]
"#
    );

    println!("{yaml}");
    Ok(())
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reindex_object(start: &str, end: &str) -> serde_json::Value {
        json!({
            "apiVersion": "activity.platform.io/v1alpha1",
            "kind": "ReindexJob",
            "metadata": {"name": "replay"},
            "spec": {
                "timeRange": {"startTime": start, "endTime": end}
            }
        })
    }

    fn recent_window() -> (String, String) {
        let end = Utc::now() - chrono::Duration::days(1);
        let start = end - chrono::Duration::days(7);
        (start.to_rfc3339(), end.to_rfc3339())
    }

    #[test]
    fn test_build_admission_response_allowed() {
        let resp = build_admission_response("test-uid-123", true, None);
        let v: serde_json::Value = serde_json::from_str(&resp).unwrap();
        assert_eq!(v["response"]["uid"], "test-uid-123");
        assert_eq!(v["response"]["allowed"], true);
        assert!(v["response"]["status"].is_null());
    }

    #[test]
    fn test_build_admission_response_denied() {
        let resp = build_admission_response("test-uid-456", false, Some("spec is immutable"));
        let v: serde_json::Value = serde_json::from_str(&resp).unwrap();
        assert_eq!(v["response"]["allowed"], false);
        assert_eq!(v["response"]["status"]["message"], "spec is immutable");
    }

    #[test]
    fn test_review_reindex_create_valid() {
        let (start, end) = recent_window();
        let request = json!({"object": reindex_object(&start, &end)});
        let verdict = review_request("ReindexJob", "CREATE", &request);
        assert!(verdict.allowed, "violations: {:?}", verdict.violations);
    }

    #[test]
    fn test_review_reindex_create_invalid_window() {
        let request = json!({"object": reindex_object(
            "2026-02-20T00:00:00Z",
            "2026-02-10T00:00:00Z"
        )});
        let verdict = review_request("ReindexJob", "CREATE", &request);
        assert!(!verdict.allowed);
    }

    #[test]
    fn test_review_reindex_update_spec_change_denied() {
        let (start, end) = recent_window();
        let old = reindex_object(&start, &end);
        let mut new = old.clone();
        new["spec"]["timeRange"]["endTime"] = json!(Utc::now().to_rfc3339());

        let request = json!({"oldObject": old, "object": new});
        let verdict = review_request("ReindexJob", "UPDATE", &request);
        assert!(!verdict.allowed);
        assert!(verdict.violations[0].contains("immutable"));
    }

    #[test]
    fn test_review_reindex_update_status_only_allowed() {
        let (start, end) = recent_window();
        let old = reindex_object(&start, &end);
        let mut new = old.clone();
        new["status"] = json!({"phase": "Running"});

        let request = json!({"oldObject": old, "object": new});
        let verdict = review_request("ReindexJob", "UPDATE", &request);
        assert!(verdict.allowed);
    }

    #[test]
    fn test_review_policy_bad_expression_denied() {
        let request = json!({"object": {
            "apiVersion": "activity.platform.io/v1alpha1",
            "kind": "ActivityPolicy",
            "metadata": {"name": "p"},
            "spec": {
                "resource": {"apiGroup": "apps", "kind": "Deployment"},
                "auditRules": [{"match": "((", "summary": "\"x\""}]
            }
        }});
        let verdict = review_request("ActivityPolicy", "CREATE", &request);
        assert!(!verdict.allowed);
    }

    #[test]
    fn test_review_unknown_kind_fails_open() {
        let request = json!({"object": {"kind": "Pod"}});
        let verdict = review_request("Pod", "CREATE", &request);
        assert!(verdict.allowed);
    }

    #[test]
    fn test_review_unparseable_object_fails_open() {
        let request = json!({"object": {"spec": 42}});
        let verdict = review_request("ReindexJob", "CREATE", &request);
        assert!(verdict.allowed);
    }

    #[test]
    fn test_generate_self_signed_certs() {
        let (ca_pem, cert_pem, key_pem) =
            generate_self_signed_certs("my-webhook", "production").unwrap();

        assert!(ca_pem.contains("BEGIN CERTIFICATE"));
        assert!(cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(key_pem.contains("BEGIN PRIVATE KEY"));
        assert_ne!(ca_pem, cert_pem);
    }

    #[test]
    fn test_validate_tls_files_missing_cert() {
        let result = validate_tls_files("/nonexistent/cert.pem", "/nonexistent/key.pem");
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("certificate file not found")
        );
    }

    #[test]
    fn test_install_config_output() {
        let temp_dir = std::env::temp_dir().join("kube-activity-test-webhook");
        let _ = std::fs::create_dir_all(&temp_dir);
        let ca_path = temp_dir.join("test-ca.crt");
        std::fs::write(&ca_path, "FAKE-CA-CERT").unwrap();

        let result = install_config("test-webhook", "test-ns", ca_path.to_str().unwrap());
        assert!(result.is_ok());

        let _ = std::fs::remove_dir_all(&temp_dir);
    }

    #[test]
    fn test_webhook_metrics_registered() {
        LazyLock::force(&WEBHOOK_DURATION);
        let families = WEBHOOK_REGISTRY.gather();
        let names: Vec<&str> = families.iter().map(|f| f.get_name()).collect();
        assert!(names.contains(&"webhook_request_duration_seconds"));
    }
}
