use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "kube-activity")]
#[command(about = "Audit-and-event activity pipeline")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Broker connection parameters, shared by every command that talks NATS.
#[derive(Args, Clone)]
pub struct NatsArgs {
    #[arg(long, env = "NATS_URL", default_value = "nats://127.0.0.1:4222")]
    pub nats_url: String,
}

/// Analytical-store connection parameters.
#[derive(Args, Clone)]
pub struct StoreArgs {
    #[arg(long, env = "CLICKHOUSE_URL", default_value = "http://127.0.0.1:8123")]
    pub clickhouse_url: String,

    #[arg(long, env = "CLICKHOUSE_DATABASE", default_value = "activity")]
    pub clickhouse_database: String,

    #[arg(long, env = "CLICKHOUSE_USER")]
    pub clickhouse_user: Option<String>,

    #[arg(long, env = "CLICKHOUSE_PASSWORD", hide_env_values = true)]
    pub clickhouse_password: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Display application version
    Version,

    /// Pre-flight checks: cluster, CRDs, broker streams, store
    Check {
        #[command(flatten)]
        nats: NatsArgs,

        #[command(flatten)]
        store: StoreArgs,
    },

    /// Manage the ActivityPolicy and ReindexJob CRDs
    Crd {
        #[command(subcommand)]
        action: CrdAction,
    },

    /// Run the stream-processing core (audit + event consumers)
    Processor {
        #[command(flatten)]
        nats: NatsArgs,

        /// Workers per consumer pipeline
        #[arg(long, default_value_t = 4)]
        workers: usize,

        /// Messages fetched per batch
        #[arg(long, default_value_t = 100)]
        batch_size: usize,

        /// Durable consumer name on the audit stream
        #[arg(long, default_value = "activity-processor")]
        audit_consumer: String,

        /// Durable consumer name on the event stream
        #[arg(long, default_value = "activity-event-processor")]
        event_consumer: String,

        /// Disable the dead-letter stream (failures are still classified)
        #[arg(long)]
        disable_dlq: bool,
    },

    /// Run the policy readiness and re-index job controllers
    Reconcile {
        #[command(flatten)]
        nats: NatsArgs,

        #[command(flatten)]
        store: StoreArgs,

        /// Image the re-index worker Jobs run
        #[arg(long, env = "REINDEX_WORKER_IMAGE", default_value = "kube-activity:latest")]
        worker_image: String,

        /// Namespace worker Jobs are created in
        #[arg(long, env = "REINDEX_WORKER_NAMESPACE", default_value = "default")]
        worker_namespace: String,

        /// Concurrent re-index jobs allowed cluster-wide
        #[arg(long, default_value_t = 1)]
        max_concurrent: usize,
    },

    /// Re-index worker entrypoint (launched by the reconciler)
    ReindexWorker {
        /// Name of the ReindexJob to execute
        #[arg(long)]
        job: String,

        #[command(flatten)]
        nats: NatsArgs,

        #[command(flatten)]
        store: StoreArgs,
    },

    /// Create and inspect ReindexJob objects
    Reindex {
        #[command(subcommand)]
        action: ReindexAction,
    },

    /// Manage the validating admission webhook
    Webhook {
        #[command(subcommand)]
        action: WebhookAction,
    },
}

#[derive(Subcommand)]
pub enum CrdAction {
    /// Print both CRDs as YAML to stdout
    Generate,

    /// Install both CRDs into the connected cluster
    Install,
}

#[derive(Subcommand)]
pub enum ReindexAction {
    /// Create a ReindexJob
    Create {
        /// Job name
        name: String,

        /// Window start (RFC 3339)
        #[arg(long)]
        start: String,

        /// Window end (RFC 3339); defaults to now
        #[arg(long)]
        end: Option<String>,

        /// Restrict to these policy names
        #[arg(long = "policy")]
        policies: Vec<String>,

        #[arg(long, default_value_t = 1000)]
        batch_size: u32,

        #[arg(long, default_value_t = 100)]
        rate_limit: u32,

        /// Evaluate and count but never publish
        #[arg(long)]
        dry_run: bool,

        /// Seconds to keep the worker after completion
        #[arg(long)]
        ttl: Option<i64>,
    },

    /// Show one job's phase and progress
    Status {
        name: String,

        /// Poll until the job reaches a terminal phase
        #[arg(long)]
        watch: bool,
    },

    /// List all ReindexJob objects
    List,
}

#[derive(Subcommand)]
pub enum WebhookAction {
    /// Start the admission webhook HTTPS server
    Serve {
        #[arg(long, default_value = "0.0.0.0:8443")]
        addr: String,
        #[arg(long, default_value = "tls.crt")]
        tls_cert: String,
        #[arg(long, default_value = "tls.key")]
        tls_key: String,
    },

    /// Generate self-signed TLS certificates for development
    CertGenerate {
        #[arg(long, default_value = "kube-activity-webhook")]
        service_name: String,
        #[arg(long, default_value = "default")]
        namespace: String,
        #[arg(long, default_value = ".")]
        output_dir: String,
    },

    /// Print the ValidatingWebhookConfiguration YAML
    InstallConfig {
        #[arg(long, default_value = "kube-activity-webhook")]
        service_name: String,
        #[arg(long, default_value = "default")]
        namespace: String,
        #[arg(long)]
        ca_bundle_path: String,
    },
}
