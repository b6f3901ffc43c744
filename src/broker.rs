//! NATS JetStream plumbing: connection, stream topology, durable pull
//! consumers and the bounded publish path.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_nats::jetstream;
use async_nats::jetstream::consumer::{AckPolicy, PullConsumer, pull};
use async_nats::jetstream::stream::RetentionPolicy;
use backoff::ExponentialBackoffBuilder;
use backoff::backoff::Backoff;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/* ============================= TOPOLOGY ============================= */

/// Input stream of API-server audit records.
pub const AUDIT_STREAM: &str = "AUDIT_EVENTS";
pub const AUDIT_SUBJECTS: &str = "audit.k8s.>";
pub const AUDIT_CONSUMER: &str = "activity-processor";

/// Input stream of Kubernetes Event objects.
pub const EVENT_STREAM: &str = "EVENTS";
pub const EVENT_SUBJECTS: &str = "events.>";
pub const EVENT_CONSUMER: &str = "activity-event-processor";

/// Real-time output stream.
pub const ACTIVITY_STREAM: &str = "ACTIVITIES";
pub const ACTIVITY_SUBJECT_PREFIX: &str = "activities";

/// Re-index output stream, separate so replays never fan out to watch
/// clients of the real-time stream.
pub const REINDEX_STREAM: &str = "ACTIVITIES_REINDEX";
pub const REINDEX_SUBJECT_PREFIX: &str = "activities.reindex";

/// Dead-letter stream.
pub const DLQ_STREAM: &str = "ACTIVITY_DEAD_LETTER";
pub const DLQ_SUBJECT_PREFIX: &str = "activity.dlq";

/// Per-message redelivery budget before the broker parks the message.
pub const MAX_DELIVER: i64 = 5;
pub const ACK_WAIT: Duration = Duration::from_secs(30);

/// Bounded wait for publishes; a sick broker must not stall workers.
pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Grace budget for draining the connection at shutdown.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/* ============================= ERRORS ============================= */

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("broker publish failed: {0}")]
    Publish(String),

    #[error("publish timed out after {0:?}")]
    PublishTimeout(Duration),

    #[error("dead letter publish failed: {0}")]
    DeadLetter(String),

    #[error("broker setup failed: {0}")]
    Setup(String),
}

/* ============================= HEALTH ============================= */

/// Started-and-healthy flag: cleared on the first disconnect, re-set on
/// reconnect. Read by the readiness probe.
#[derive(Clone, Default)]
pub struct BrokerHealth {
    connected: Arc<AtomicBool>,
}

impl BrokerHealth {
    pub fn new() -> Self {
        BrokerHealth {
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn set(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }
}

/* ============================= CONNECTION ============================= */

/// Connect to the broker with unlimited reconnects.
///
/// Connection events keep the health flag current; a lame-duck notification
/// from the server cancels `shutdown` so the process drains gracefully.
pub async fn connect(
    url: &str,
    health: BrokerHealth,
    shutdown: CancellationToken,
) -> Result<async_nats::Client, PipelineError> {
    let callback_health = health.clone();
    let client = async_nats::ConnectOptions::new()
        .name("kube-activity")
        .retry_on_initial_connect()
        .event_callback(move |event| {
            let health = callback_health.clone();
            let shutdown = shutdown.clone();
            async move {
                match event {
                    async_nats::Event::Connected => {
                        info!("broker_connected");
                        health.set(true);
                    }
                    async_nats::Event::Disconnected => {
                        warn!("broker_disconnected");
                        health.set(false);
                    }
                    async_nats::Event::LameDuckMode => {
                        warn!("broker_lame_duck_initiating_shutdown");
                        shutdown.cancel();
                    }
                    other => {
                        tracing::debug!(event = %other, "broker_event");
                    }
                }
            }
        })
        .connect(url)
        .await
        .map_err(|e| PipelineError::Setup(e.to_string()))?;

    health.set(true);
    Ok(client)
}

/* ============================= STREAMS ============================= */

fn stream_config(name: &str, subjects: Vec<String>, max_age: Duration) -> jetstream::stream::Config {
    jetstream::stream::Config {
        name: name.to_string(),
        subjects,
        retention: RetentionPolicy::Limits,
        max_age,
        duplicate_window: Duration::from_secs(600),
        ..Default::default()
    }
}

/// Ensure the five streams exist with their subject filters.
///
/// The real-time stream enumerates the tenant-type roots because JetStream
/// forbids overlapping subject filters and `activities.reindex.>` must live
/// on its own stream.
pub async fn ensure_streams(js: &jetstream::Context) -> Result<(), PipelineError> {
    let activity_subjects = vec![
        "activities.platform.>".to_string(),
        "activities.organization.>".to_string(),
        "activities.project.>".to_string(),
        "activities.user.>".to_string(),
    ];

    let configs = vec![
        stream_config(
            AUDIT_STREAM,
            vec![AUDIT_SUBJECTS.to_string()],
            Duration::from_secs(7 * 24 * 3600),
        ),
        stream_config(
            EVENT_STREAM,
            vec![EVENT_SUBJECTS.to_string()],
            Duration::from_secs(7 * 24 * 3600),
        ),
        stream_config(
            ACTIVITY_STREAM,
            activity_subjects,
            Duration::from_secs(7 * 24 * 3600),
        ),
        stream_config(
            REINDEX_STREAM,
            vec![format!("{REINDEX_SUBJECT_PREFIX}.>")],
            Duration::from_secs(24 * 3600),
        ),
        stream_config(
            DLQ_STREAM,
            vec![format!("{DLQ_SUBJECT_PREFIX}.>")],
            Duration::from_secs(7 * 24 * 3600),
        ),
    ];

    for config in configs {
        let name = config.name.clone();
        js.get_or_create_stream(config)
            .await
            .map_err(|e| PipelineError::Setup(format!("stream {name}: {e}")))?;
    }

    info!("broker_streams_ready");
    Ok(())
}

/// Bind the durable pull consumer for an input stream.
pub async fn pull_consumer(
    js: &jetstream::Context,
    stream_name: &str,
    consumer_name: &str,
) -> Result<PullConsumer, PipelineError> {
    let stream = js
        .get_stream(stream_name)
        .await
        .map_err(|e| PipelineError::Setup(format!("stream {stream_name}: {e}")))?;

    stream
        .get_or_create_consumer(
            consumer_name,
            pull::Config {
                durable_name: Some(consumer_name.to_string()),
                ack_policy: AckPolicy::Explicit,
                ack_wait: ACK_WAIT,
                max_deliver: MAX_DELIVER,
                ..Default::default()
            },
        )
        .await
        .map_err(|e| PipelineError::Setup(format!("consumer {consumer_name}: {e}")))
}

/* ============================= PUBLISH ============================= */

fn publish_backoff() -> backoff::ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_secs(1))
        .with_multiplier(2.0)
        .with_max_interval(Duration::from_secs(30))
        .with_max_elapsed_time(None)
        .build()
}

async fn publish_once(
    js: &jetstream::Context,
    subject: &str,
    msg_id: &str,
    payload: &Bytes,
) -> Result<(), PipelineError> {
    let mut headers = async_nats::HeaderMap::new();
    headers.insert(async_nats::header::NATS_MESSAGE_ID, msg_id);

    let publish = async {
        js.publish_with_headers(subject.to_string(), headers, payload.clone())
            .await
            .map_err(|e| PipelineError::Publish(e.to_string()))?
            .await
            .map_err(|e| PipelineError::Publish(e.to_string()))
            .map(|_| ())
    };

    match tokio::time::timeout(PUBLISH_TIMEOUT, publish).await {
        Ok(result) => result,
        Err(_) => Err(PipelineError::PublishTimeout(PUBLISH_TIMEOUT)),
    }
}

/// Publish with the deduplicating message-ID, retrying up to three attempts
/// with jittered exponential backoff.
pub async fn publish_with_retry(
    js: &jetstream::Context,
    subject: &str,
    msg_id: &str,
    payload: Vec<u8>,
) -> Result<(), PipelineError> {
    const MAX_ATTEMPTS: u32 = 3;

    let payload = Bytes::from(payload);
    let mut policy = publish_backoff();

    let mut attempt = 0;
    loop {
        attempt += 1;
        match publish_once(js, subject, msg_id, &payload).await {
            Ok(()) => return Ok(()),
            Err(err) if attempt < MAX_ATTEMPTS => {
                let delay = policy
                    .next_backoff()
                    .unwrap_or(Duration::from_secs(30));
                warn!(
                    subject = %subject,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "publish_retry"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/* ============================= SHUTDOWN ============================= */

/// Drain the connection within the shutdown budget, then force-close.
pub async fn drain(client: async_nats::Client) {
    match tokio::time::timeout(DRAIN_TIMEOUT, client.drain()).await {
        Ok(Ok(())) => info!("broker_drained"),
        Ok(Err(e)) => warn!(error = %e, "broker_drain_failed"),
        Err(_) => warn!(budget_secs = DRAIN_TIMEOUT.as_secs(), "broker_drain_timed_out"),
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_flag_transitions() {
        let health = BrokerHealth::new();
        assert!(!health.is_connected());
        health.set(true);
        assert!(health.is_connected());
        health.set(false);
        assert!(!health.is_connected());
    }

    #[test]
    fn test_stream_config_shape() {
        let config = stream_config("S", vec!["s.>".to_string()], Duration::from_secs(60));
        assert_eq!(config.name, "S");
        assert_eq!(config.subjects, vec!["s.>".to_string()]);
        assert_eq!(config.max_age, Duration::from_secs(60));
        assert_eq!(config.duplicate_window, Duration::from_secs(600));
    }

    #[test]
    fn test_backoff_delays_stay_bounded() {
        let mut policy = publish_backoff();
        // jitter (randomization factor 0.5) can push each delay to 1.5x the
        // current interval; the cap bounds the interval at 30s
        for _ in 0..10 {
            let delay = policy.next_backoff().expect("backoff never exhausts");
            assert!(delay <= Duration::from_secs(45));
        }
    }

    #[test]
    fn test_topology_constants() {
        assert_eq!(AUDIT_SUBJECTS, "audit.k8s.>");
        assert_eq!(EVENT_SUBJECTS, "events.>");
        assert_eq!(ACTIVITY_SUBJECT_PREFIX, "activities");
        assert_eq!(REINDEX_SUBJECT_PREFIX, "activities.reindex");
        assert_eq!(DLQ_SUBJECT_PREFIX, "activity.dlq");
        assert_eq!(MAX_DELIVER, 5);
        assert_eq!(ACK_WAIT, Duration::from_secs(30));
    }
}
