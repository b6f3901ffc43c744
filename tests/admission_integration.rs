mod common;

use chrono::{Duration, Utc};

use common::ready_policy;
use kube_activity::admission::{
    validate_policy, validate_reindex_create, validate_reindex_update,
};
use kube_activity::crd::{
    PolicySelector, ReindexConfigSpec, ReindexJob, ReindexJobSpec, TimeRange,
};

fn job(start_days_ago: i64, end_days_ago: Option<i64>) -> ReindexJob {
    let now = Utc::now();
    ReindexJob::new(
        "replay",
        ReindexJobSpec {
            time_range: TimeRange {
                start_time: (now - Duration::days(start_days_ago)).to_rfc3339(),
                end_time: end_days_ago.map(|d| (now - Duration::days(d)).to_rfc3339()),
            },
            ..Default::default()
        },
    )
}

#[test]
fn typical_job_passes_the_full_gauntlet() {
    let mut job = job(30, Some(1));
    job.spec.policy_selector = Some(PolicySelector {
        names: Some(vec!["deployment-activity".to_string()]),
        match_labels: None,
    });
    job.spec.config = Some(ReindexConfigSpec {
        batch_size: Some(1000),
        rate_limit: Some(100),
        dry_run: Some(true),
    });
    job.spec.ttl_seconds_after_finished = Some(3600);

    let verdict = validate_reindex_create(&job, Utc::now());
    assert!(verdict.allowed, "violations: {:?}", verdict.violations);
}

#[test]
fn window_rules_are_enforced_together() {
    // inverted window AND out-of-retention start accumulate
    let mut bad = job(90, Some(1));
    bad.spec.time_range.end_time =
        Some((Utc::now() - Duration::days(95)).to_rfc3339());

    let verdict = validate_reindex_create(&bad, Utc::now());
    assert!(!verdict.allowed);
    assert!(verdict.violations.len() >= 2);
}

#[test]
fn bounds_are_inclusive() {
    for (batch, rate, ok) in [
        (100, 10, true),
        (10_000, 1_000, true),
        (99, 10, false),
        (100, 9, false),
    ] {
        let mut j = job(30, Some(1));
        j.spec.config = Some(ReindexConfigSpec {
            batch_size: Some(batch),
            rate_limit: Some(rate),
            dry_run: None,
        });
        assert_eq!(
            validate_reindex_create(&j, Utc::now()).allowed,
            ok,
            "batch={batch} rate={rate}"
        );
    }
}

#[test]
fn selector_exclusivity() {
    let mut j = job(30, Some(1));
    j.spec.policy_selector = Some(PolicySelector {
        names: Some(vec!["a".to_string()]),
        match_labels: Some([("k".to_string(), "v".to_string())].into()),
    });
    assert!(!validate_reindex_create(&j, Utc::now()).allowed);
}

#[test]
fn spec_is_frozen_after_creation() {
    let old = job(30, Some(1));

    // status progress updates sail through
    let mut status_update = old.clone();
    status_update.status = Some(Default::default());
    assert!(validate_reindex_update(&old, &status_update).allowed);

    // every spec field is frozen
    let mut window_change = old.clone();
    window_change.spec.time_range.end_time = Some(Utc::now().to_rfc3339());
    assert!(!validate_reindex_update(&old, &window_change).allowed);

    let mut config_change = old.clone();
    config_change.spec.config = Some(ReindexConfigSpec {
        batch_size: Some(500),
        rate_limit: None,
        dry_run: None,
    });
    assert!(!validate_reindex_update(&old, &config_change).allowed);

    let mut selector_change = old.clone();
    selector_change.spec.policy_selector = Some(PolicySelector {
        names: Some(vec!["other".to_string()]),
        match_labels: None,
    });
    assert!(!validate_reindex_update(&old, &selector_change).allowed);
}

#[test]
fn policy_expressions_validated_at_admission() {
    let good = ready_policy(
        "good",
        "apps",
        "Deployment",
        vec![(r#"audit.verb == "create""#, r#""created""#)],
        vec![],
    );
    assert!(validate_policy(&good).allowed);

    let bad = ready_policy(
        "bad",
        "apps",
        "Deployment",
        vec![(r#"audit.verb =="#, r#""created""#)],
        vec![],
    );
    let verdict = validate_policy(&bad);
    assert!(!verdict.allowed);
    assert!(verdict.message.unwrap().contains("does not compile"));
}
