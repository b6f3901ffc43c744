use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use kube::api::{Api, ListParams, PostParams};
use kube::Client;

use kube_activity::admission::validate_reindex_create;
use kube_activity::crd::{
    PolicySelector, ReindexConfigSpec, ReindexJob, ReindexJobSpec, ReindexProgress, TimeRange,
};

/* ============================= CREATE ============================= */

#[allow(clippy::too_many_arguments)]
pub async fn create(
    name: &str,
    start: &str,
    end: Option<String>,
    policies: Vec<String>,
    batch_size: u32,
    rate_limit: u32,
    dry_run: bool,
    ttl: Option<i64>,
) -> Result<()> {
    let job = ReindexJob::new(
        name,
        ReindexJobSpec {
            time_range: TimeRange {
                start_time: start.to_string(),
                end_time: end,
            },
            policy_selector: if policies.is_empty() {
                None
            } else {
                Some(PolicySelector {
                    names: Some(policies),
                    match_labels: None,
                })
            },
            config: Some(ReindexConfigSpec {
                batch_size: Some(batch_size),
                rate_limit: Some(rate_limit),
                dry_run: Some(dry_run),
            }),
            ttl_seconds_after_finished: ttl,
        },
    );

    // dry-run the admission checks client-side for a fast, precise error
    let verdict = validate_reindex_create(&job, Utc::now());
    if !verdict.allowed {
        bail!(
            "ReindexJob would be rejected: {}",
            verdict.message.unwrap_or_default()
        );
    }

    let client = Client::try_default()
        .await
        .context("Failed to load kubeconfig")?;
    let api: Api<ReindexJob> = Api::all(client);
    api.create(&PostParams::default(), &job).await?;

    println!("ReindexJob '{name}' created");
    if dry_run {
        println!("  (dry run: activities are counted but never published)");
    }
    println!("  Watch it with: kube-activity reindex status {name} --watch");
    Ok(())
}

/* ============================= STATUS ============================= */

pub async fn status(name: &str, watch: bool) -> Result<()> {
    let client = Client::try_default()
        .await
        .context("Failed to load kubeconfig")?;
    let api: Api<ReindexJob> = Api::all(client);

    loop {
        let job = api
            .get(name)
            .await
            .with_context(|| format!("ReindexJob '{name}' not found"))?;
        print_job(&job);

        if !watch || job.is_terminal() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
        println!();
    }
}

fn print_job(job: &ReindexJob) {
    let name = job.metadata.name.as_deref().unwrap_or("");
    println!("ReindexJob {name}");
    println!("  Phase ....................... {}", job.phase());
    println!(
        "  Window ...................... [{}, {})",
        job.spec.time_range.start_time,
        job.spec.time_range.end_time.as_deref().unwrap_or("now")
    );

    if let Some(status) = &job.status {
        if let Some(started) = &status.started_at {
            println!("  Started ..................... {started}");
        }
        if let Some(completed) = &status.completed_at {
            println!("  Completed ................... {completed}");
        }
        if let Some(progress) = &status.progress {
            print_progress(progress);
        }
        if let Some(message) = &status.message {
            println!("  Message ..................... {message}");
        }
        for condition in &status.conditions {
            println!(
                "  Condition {} ... {} ({})",
                condition.condition_type, condition.status, condition.reason
            );
        }
    }
}

fn print_progress(progress: &ReindexProgress) {
    let percent = if progress.total_events > 0 {
        (progress.processed_events * 100) / progress.total_events
    } else {
        0
    };
    println!(
        "  Progress .................... {}/{} records ({percent}%), batch {}/{}",
        progress.processed_events,
        progress.total_events,
        progress.current_batch,
        progress.total_batches
    );
    println!(
        "  Generated ................... {} activities, {} errors",
        progress.activities_generated, progress.errors
    );
}

/* ============================= LIST ============================= */

pub async fn list() -> Result<()> {
    let client = Client::try_default()
        .await
        .context("Failed to load kubeconfig")?;
    let api: Api<ReindexJob> = Api::all(client);
    let jobs = api.list(&ListParams::default()).await?;

    if jobs.items.is_empty() {
        println!("No ReindexJob objects found.");
        return Ok(());
    }

    println!(
        "{:<30} {:<10} {:>12} {:>12} {:>8}",
        "NAME", "PHASE", "PROCESSED", "GENERATED", "ERRORS"
    );
    for job in &jobs.items {
        let progress = job
            .status
            .as_ref()
            .and_then(|s| s.progress.clone())
            .unwrap_or_default();
        println!(
            "{:<30} {:<10} {:>12} {:>12} {:>8}",
            job.metadata.name.as_deref().unwrap_or(""),
            job.phase().to_string(),
            progress.processed_events,
            progress.activities_generated,
            progress.errors
        );
    }
    Ok(())
}

/* ============================= TESTS ============================= */
