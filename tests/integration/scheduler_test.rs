// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use super::helpers::{repo_fixture, t0, TestContext, INSTANCE};
use chrono::Duration;
use scmsync::domain::models::repo::RepoSyncState;
use scmsync::domain::models::sync_job::{JobPayload, JobType};
use scmsync::domain::repositories::repo_repository::RepoRepository;
use scmsync::domain::repositories::sync_job_repository::SyncJobRepository;
use scmsync::domain::services::policy_engine::{SkipReason, BUCKET_LOW_TOKENS_PRIORITY_PENALTY};
use scmsync::queue::scheduler::{SchedulerConfig, TICK_LOCK_KEY};
use scmsync::queue::sync_queue::SyncQueue;
use std::collections::HashMap;

fn count_reason(result: &scmsync::queue::scheduler::SchedulerTickResult, reason: SkipReason) -> usize {
    result
        .jobs_skipped
        .iter()
        .filter(|s| s.reason == reason)
        .count()
}

#[tokio::test]
async fn test_tick_enqueues_due_repos_and_is_idempotent() {
    let ctx = TestContext::new().await;
    ctx.add_repo("alpha", None).await;
    ctx.add_repo("beta", None).await;
    let scheduler = ctx.scheduler(SchedulerConfig::default());

    let first = scheduler.run_tick(t0(), false).await.unwrap();
    assert!(first.lock_acquired);
    assert_eq!(first.jobs_built.len(), 2);
    assert!(first.jobs_built.iter().all(|j| j.job_id.is_some()));
    assert!(first.jobs_skipped.is_empty());

    let second = scheduler
        .run_tick(t0() + Duration::seconds(1), false)
        .await
        .unwrap();
    assert!(second.jobs_built.is_empty());
    assert_eq!(count_reason(&second, SkipReason::DuplicateActiveJob), 2);
    assert_eq!(ctx.queue.active_jobs().await.unwrap().len(), 2);

    // 每个入队任务消耗一个令牌
    let bucket = ctx.bucket.snapshot(INSTANCE, t0()).await.unwrap();
    assert_eq!(bucket.tokens, 98.0);
}

#[tokio::test]
async fn test_dry_run_reports_decisions_without_side_effects() {
    let ctx = TestContext::new().await;
    ctx.add_repo("alpha", None).await;
    ctx.add_repo("beta", None).await;
    let scheduler = ctx.scheduler(SchedulerConfig::default());

    let result = scheduler.run_tick(t0(), true).await.unwrap();
    assert_eq!(result.jobs_built.len(), 2);
    assert!(result.jobs_built.iter().all(|j| j.job_id.is_none()));
    assert!(ctx.queue.active_jobs().await.unwrap().is_empty());

    let bucket = ctx.bucket.snapshot(INSTANCE, t0()).await.unwrap();
    assert_eq!(bucket.tokens, bucket.capacity);

    let json = serde_json::to_value(&result).unwrap();
    assert!(json.get("jobs_built").is_some());
    assert!(json.get("jobs_skipped").is_some());
    assert_eq!(json["lock_acquired"], serde_json::json!(true));
}

#[tokio::test]
async fn test_recently_synced_repo_is_not_due() {
    let ctx = TestContext::new().await;
    let fresh = ctx.add_repo("fresh", None).await;
    let stale = ctx.add_repo("stale", None).await;

    for (repo, age_hours, watermark) in [(&fresh, 1, "100"), (&stale, 25, "200")] {
        ctx.repos
            .save_sync_state(&RepoSyncState {
                repo_id: repo.id,
                job_type: JobType::Incremental,
                watermark: Some(watermark.to_string()),
                last_synced_at: Some(t0() - Duration::hours(age_hours)),
                last_job_id: None,
                updated_at: t0(),
            })
            .await
            .unwrap();
    }

    let scheduler = ctx.scheduler(SchedulerConfig::default());
    let result = scheduler.run_tick(t0(), false).await.unwrap();
    assert_eq!(result.jobs_built.len(), 1);
    assert_eq!(result.jobs_built[0].repo_id, stale.id);

    let job_id = result.jobs_built[0].job_id.unwrap();
    let job = ctx.jobs.find_by_id(job_id).await.unwrap().unwrap();
    assert_eq!(
        job.decode_payload().unwrap(),
        JobPayload::Incremental {
            since: Some("200".to_string())
        }
    );
}

#[tokio::test]
async fn test_per_repo_repair_window_override() {
    let ctx = TestContext::new().await;
    let mut repo = repo_fixture("hourly", None);
    repo.repair_window_hours = Some(1);
    let repo = ctx.repos.create(&repo).await.unwrap();
    ctx.repos
        .save_sync_state(&RepoSyncState {
            repo_id: repo.id,
            job_type: JobType::Incremental,
            watermark: None,
            last_synced_at: Some(t0() - Duration::hours(2)),
            last_job_id: None,
            updated_at: t0(),
        })
        .await
        .unwrap();

    let scheduler = ctx.scheduler(SchedulerConfig::default());
    let result = scheduler.run_tick(t0(), true).await.unwrap();
    assert_eq!(result.jobs_built.len(), 1);
}

#[tokio::test]
async fn test_owner_budget_limits_admission() {
    let ctx = TestContext::new().await;
    for name in ["a1", "a2", "a3"] {
        ctx.add_repo(name, Some("tenant-a")).await;
    }
    let b = ctx.add_repo("b1", Some("tenant-b")).await;

    let config = SchedulerConfig {
        owner_limits: HashMap::from([("tenant-a".to_string(), 1)]),
        ..Default::default()
    };
    let result = ctx.scheduler(config).run_tick(t0(), false).await.unwrap();

    assert_eq!(result.jobs_built.len(), 2);
    assert!(result.jobs_built.iter().any(|j| j.repo_id == b.id));
    assert_eq!(count_reason(&result, SkipReason::BudgetExceeded), 2);
}

#[tokio::test]
async fn test_global_budget_counts_in_flight_jobs() {
    let ctx = TestContext::new().await;
    for name in ["a", "b", "c"] {
        ctx.add_repo(name, None).await;
    }
    let mut config = SchedulerConfig::default();
    config.policy.max_concurrent_jobs = 2;
    let scheduler = ctx.scheduler(config);

    let first = scheduler.run_tick(t0(), false).await.unwrap();
    assert_eq!(first.jobs_built.len(), 2);
    assert_eq!(count_reason(&first, SkipReason::BudgetExceeded), 1);

    let second = scheduler
        .run_tick(t0() + Duration::seconds(1), false)
        .await
        .unwrap();
    assert!(second.jobs_built.is_empty());
    assert_eq!(count_reason(&second, SkipReason::BudgetExceeded), 1);
}

#[tokio::test]
async fn test_tick_skips_when_lock_is_held_elsewhere() {
    let ctx = TestContext::new().await;
    ctx.add_repo("alpha", None).await;
    assert!(ctx
        .store
        .try_acquire_lease(TICK_LOCK_KEY, "other-process", std::time::Duration::from_secs(60))
        .await
        .unwrap());

    let result = ctx
        .scheduler(SchedulerConfig::default())
        .run_tick(t0(), false)
        .await
        .unwrap();
    assert!(!result.lock_acquired);
    assert!(result.jobs_built.is_empty());
    assert!(ctx.queue.active_jobs().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_open_breaker_skips_instance() {
    let ctx = TestContext::new().await;
    let repo = ctx.add_repo("alpha", None).await;
    let key = ctx
        .breaker
        .key_for(&repo.instance_id, repo.id, JobType::Incremental);
    for _ in 0..5 {
        ctx.breaker.record_failure(&key, t0()).await.unwrap();
    }

    let result = ctx
        .scheduler(SchedulerConfig::default())
        .run_tick(t0() + Duration::seconds(10), false)
        .await
        .unwrap();
    assert!(result.jobs_built.is_empty());
    assert_eq!(count_reason(&result, SkipReason::CircuitOpen), 1);
}

#[tokio::test]
async fn test_half_open_breaker_admits_single_probe() {
    let ctx = TestContext::new().await;
    let first = ctx.add_repo("alpha", None).await;
    ctx.add_repo("beta", None).await;
    let key = ctx
        .breaker
        .key_for(&first.instance_id, first.id, JobType::Incremental);
    let opened_at = t0() - Duration::minutes(2);
    for _ in 0..5 {
        ctx.breaker.record_failure(&key, opened_at).await.unwrap();
    }

    let scheduler = ctx.scheduler(SchedulerConfig::default());
    let result = scheduler.run_tick(t0(), false).await.unwrap();
    assert_eq!(result.jobs_built.len(), 1);
    assert!(result.jobs_built[0].is_probe);
    assert_eq!(count_reason(&result, SkipReason::ProbeInFlight), 1);

    let view = ctx.breaker.snapshot(&key, t0()).await.unwrap();
    assert!(view.probe_in_flight);

    let next = scheduler
        .run_tick(t0() + Duration::seconds(1), false)
        .await
        .unwrap();
    assert!(next.jobs_built.is_empty());
    assert_eq!(count_reason(&next, SkipReason::DuplicateActiveJob), 1);
    assert_eq!(count_reason(&next, SkipReason::ProbeInFlight), 1);
}

#[tokio::test]
async fn test_paused_bucket_skips_backfill_and_penalizes_incremental() {
    let ctx = TestContext::new().await;
    let mut repo = repo_fixture("alpha", None);
    repo.job_types = vec![JobType::Incremental, JobType::Backfill];
    let repo = ctx.repos.create(&repo).await.unwrap();
    ctx.bucket
        .pause(INSTANCE, t0() + Duration::minutes(10), t0())
        .await
        .unwrap();

    let result = ctx
        .scheduler(SchedulerConfig::default())
        .run_tick(t0(), false)
        .await
        .unwrap();

    assert_eq!(result.jobs_built.len(), 1);
    let built = &result.jobs_built[0];
    assert_eq!(built.repo_id, repo.id);
    assert_eq!(built.job_type, JobType::Incremental);
    assert_eq!(built.effective_priority, 10 - BUCKET_LOW_TOKENS_PRIORITY_PENALTY);

    assert_eq!(result.jobs_skipped.len(), 1);
    assert_eq!(result.jobs_skipped[0].job_type, JobType::Backfill);
    assert_eq!(result.jobs_skipped[0].reason, SkipReason::BucketPaused);
}

#[tokio::test]
async fn test_backfill_payload_covers_repair_window() {
    let ctx = TestContext::new().await;
    let mut repo = repo_fixture("alpha", None);
    repo.job_types = vec![JobType::Backfill];
    let repo = ctx.repos.create(&repo).await.unwrap();

    let result = ctx
        .scheduler(SchedulerConfig::default())
        .run_tick(t0(), false)
        .await
        .unwrap();
    let job_id = result.jobs_built[0].job_id.unwrap();
    let job = ctx.jobs.find_by_id(job_id).await.unwrap().unwrap();

    assert_eq!(job.repo_id, repo.id);
    assert_eq!(
        job.decode_payload().unwrap(),
        JobPayload::Backfill {
            since: t0() - Duration::hours(24),
            until: t0(),
            update_watermark: false,
        }
    );
}
