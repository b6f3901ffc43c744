//! The re-index engine.
//!
//! Replays historical source records from the analytical store through a
//! policy cache and publishes the resulting activities to the dedicated
//! re-index stream. Runs inside the worker process; the reconciler only
//! launches and observes it.
//!
//! Idempotence is not the engine's concern: every publish carries a fresh
//! version stamp and the store's replacing-merge collapses repeated replays
//! of the same source record.

use std::num::NonZeroU32;

use async_nats::jetstream;
use chrono::{DateTime, Utc};
use governor::{Quota, RateLimiter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::activity::build_reindex_subject;
use crate::broker::{PipelineError, REINDEX_SUBJECT_PREFIX, publish_with_retry};
use crate::cache::PolicyCache;
use crate::consumer::{Outcome, process_audit, process_event};
use crate::crd::{MAX_RATE_LIMIT, MIN_RATE_LIMIT, ReindexProgress};
use crate::store::{Cursor, SourceReader, SourceTable, StoreError};

/* ============================= CONFIG & ERRORS ============================= */

#[derive(Debug, Clone)]
pub struct ReindexRunConfig {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub batch_size: u64,
    pub rate_limit: u32,
    pub dry_run: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ReindexError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("re-index publish failed: {0}")]
    Publish(#[from] PipelineError),

    #[error("re-index cancelled")]
    Cancelled,
}

/* ============================= SEAMS ============================= */

/// Publish seam so the engine runs against a recording fake in tests.
#[async_trait::async_trait]
pub trait ReindexPublisher: Send + Sync {
    async fn publish(
        &self,
        subject: &str,
        msg_id: &str,
        payload: Vec<u8>,
    ) -> Result<(), PipelineError>;
}

/// JetStream publisher for the re-index stream.
pub struct JetStreamReindexPublisher {
    js: jetstream::Context,
}

impl JetStreamReindexPublisher {
    pub fn new(js: jetstream::Context) -> Self {
        JetStreamReindexPublisher { js }
    }
}

#[async_trait::async_trait]
impl ReindexPublisher for JetStreamReindexPublisher {
    async fn publish(
        &self,
        subject: &str,
        msg_id: &str,
        payload: Vec<u8>,
    ) -> Result<(), PipelineError> {
        publish_with_retry(&self.js, subject, msg_id, payload).await
    }
}

/// Status updates are best-effort; the engine logs failures and keeps going.
#[async_trait::async_trait]
pub trait ProgressSink: Send + Sync {
    async fn update(&self, progress: &ReindexProgress) -> anyhow::Result<()>;
}

/// Sink for runs without a job object to report to.
pub struct NoopProgressSink;

#[async_trait::async_trait]
impl ProgressSink for NoopProgressSink {
    async fn update(&self, _progress: &ReindexProgress) -> anyhow::Result<()> {
        Ok(())
    }
}

/* ============================= ENGINE ============================= */

/// Replay the configured window. Audit rows run first, then event rows;
/// the two tables are never interleaved.
pub async fn run_reindex(
    reader: &dyn SourceReader,
    cache: &PolicyCache,
    publisher: &dyn ReindexPublisher,
    progress_sink: &dyn ProgressSink,
    config: &ReindexRunConfig,
    shutdown: &CancellationToken,
) -> Result<ReindexProgress, ReindexError> {
    // one count query per table up front; accepted as expensive, and only
    // advisory from here on
    let audit_total = reader
        .count_window(SourceTable::AuditLogs, config.start, config.end)
        .await?;
    let event_total = reader
        .count_window(SourceTable::K8sEvents, config.start, config.end)
        .await?;

    let total = audit_total + event_total;
    let mut progress = ReindexProgress {
        total_events: total,
        total_batches: total.div_ceil(config.batch_size.max(1)),
        ..Default::default()
    };

    info!(
        start = %config.start,
        end = %config.end,
        audit_rows = audit_total,
        event_rows = event_total,
        dry_run = config.dry_run,
        "reindex_started"
    );
    report(progress_sink, &progress).await;

    let rate = config.rate_limit.clamp(MIN_RATE_LIMIT, MAX_RATE_LIMIT);
    let quota = Quota::per_second(NonZeroU32::new(rate).expect("rate bounds are non-zero"))
        .allow_burst(NonZeroU32::new(rate.saturating_mul(2)).expect("burst bounds are non-zero"));
    let limiter = RateLimiter::direct(quota);

    for table in [SourceTable::AuditLogs, SourceTable::K8sEvents] {
        let mut cursor: Option<Cursor> = None;

        loop {
            if shutdown.is_cancelled() {
                return Err(ReindexError::Cancelled);
            }

            let rows = reader
                .fetch_page(table, config.start, config.end, cursor.as_ref(), config.batch_size)
                .await?;

            // zero rows is the normal end of the cursor
            let Some(last) = rows.last() else { break };
            cursor = Some(Cursor::from_row(last));

            for row in &rows {
                limiter.until_ready().await;

                let outcome = match table {
                    SourceTable::AuditLogs => {
                        process_audit(row.data.as_bytes(), cache, Utc::now())
                    }
                    SourceTable::K8sEvents => {
                        process_event(row.data.as_bytes(), cache, Utc::now())
                    }
                };

                match outcome {
                    Outcome::Publish(activity) => {
                        progress.activities_generated += 1;
                        if !config.dry_run {
                            let subject =
                                build_reindex_subject(REINDEX_SUBJECT_PREFIX, &activity);
                            let payload = serde_json::to_vec(activity.as_ref())
                                .map_err(|e| PipelineError::Publish(e.to_string()))?;
                            publisher
                                .publish(&subject, &activity.metadata.name, payload)
                                .await?;
                        }
                    }
                    Outcome::DeadLetter(event) => {
                        progress.errors += 1;
                        debug!(
                            row = %row.id,
                            error_type = event.error_type.as_str(),
                            error = %event.error,
                            "reindex_row_failed"
                        );
                    }
                    Outcome::Skip(_) => {}
                }

                progress.processed_events += 1;
            }

            progress.current_batch += 1;
            report(progress_sink, &progress).await;
        }
    }

    info!(
        processed = progress.processed_events,
        generated = progress.activities_generated,
        errors = progress.errors,
        "reindex_completed"
    );
    Ok(progress)
}

async fn report(sink: &dyn ProgressSink, progress: &ReindexProgress) {
    if let Err(err) = sink.update(progress).await {
        // a failed status update never aborts the batch
        warn!(error = %err, "reindex_progress_update_failed");
    }
}

/* ============================= TESTS ============================= */
