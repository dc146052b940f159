// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use super::helpers::{repo_fixture, t0, TestContext};
use chrono::Duration;
use scmsync::domain::models::circuit_breaker::CircuitStatus;
use scmsync::domain::models::repo::RepoSyncState;
use scmsync::domain::models::sync_job::{JobPayload, JobStatus, JobType};
use scmsync::domain::repositories::repo_repository::RepoRepository;
use scmsync::domain::repositories::sync_job_repository::SyncJobRepository;
use scmsync::domain::services::circuit_breaker::CircuitBreakerConfig;
use scmsync::domain::services::rate_limit_bucket::BucketConfig;
use scmsync::queue::sync_queue::{QueueError, SyncQueue};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

#[tokio::test]
async fn test_enqueue_rejects_second_active_job_for_same_repo() {
    let ctx = TestContext::new().await;
    let repo = ctx.add_repo("alpha", None).await;
    let candidate = ctx.incremental_candidate(&repo, None);

    ctx.queue.enqueue(&candidate, 10, t0()).await.unwrap();
    let err = ctx.queue.enqueue(&candidate, 10, t0()).await.unwrap_err();
    assert!(matches!(
        err,
        QueueError::DuplicateJob { repo_id, job_type: JobType::Incremental } if repo_id == repo.id
    ));

    // 终态任务不参与唯一约束
    let worker = Uuid::new_v4();
    let job = ctx.queue.claim(worker, t0()).await.unwrap().unwrap();
    ctx.queue.ack_success(&job, None, t0()).await.unwrap();
    ctx.queue.enqueue(&candidate, 10, t0()).await.unwrap();
    assert_eq!(ctx.queue.active_jobs().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_claim_orders_by_priority_then_schedule() {
    let ctx = TestContext::new().await;
    let low = ctx.add_repo("low", None).await;
    let high_late = ctx.add_repo("high-late", None).await;
    let high_early = ctx.add_repo("high-early", None).await;

    ctx.queue
        .enqueue(&ctx.incremental_candidate(&low, None), 5, t0())
        .await
        .unwrap();
    ctx.queue
        .enqueue(
            &ctx.incremental_candidate(&high_late, None),
            10,
            t0() + Duration::seconds(2),
        )
        .await
        .unwrap();
    ctx.queue
        .enqueue(
            &ctx.incremental_candidate(&high_early, None),
            10,
            t0() + Duration::seconds(1),
        )
        .await
        .unwrap();

    let worker = Uuid::new_v4();
    let now = t0() + Duration::seconds(10);
    let order: Vec<Uuid> = vec![
        ctx.queue.claim(worker, now).await.unwrap().unwrap().repo_id,
        ctx.queue.claim(worker, now).await.unwrap().unwrap().repo_id,
        ctx.queue.claim(worker, now).await.unwrap().unwrap().repo_id,
    ];
    assert_eq!(order, vec![high_early.id, high_late.id, low.id]);
    assert!(ctx.queue.claim(worker, now).await.unwrap().is_none());
}

#[tokio::test]
async fn test_claim_sets_holder_and_mark_running_requires_it() {
    let ctx = TestContext::new().await;
    let repo = ctx.add_repo("alpha", None).await;
    ctx.queue
        .enqueue(&ctx.incremental_candidate(&repo, None), 10, t0())
        .await
        .unwrap();

    let worker = Uuid::new_v4();
    let job = ctx.queue.claim(worker, t0()).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Claimed);
    assert!(job.is_held_by(worker));
    assert_eq!(job.attempt_count, 0);

    let err = ctx
        .queue
        .mark_running(&job, Uuid::new_v4(), t0())
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::NotHeld(_)));

    ctx.queue.mark_running(&job, worker, t0()).await.unwrap();
    let stored = ctx.jobs.find_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Running);
}

#[tokio::test]
async fn test_ack_success_advances_incremental_watermark() {
    let ctx = TestContext::new().await;
    let repo = ctx.add_repo("alpha", None).await;
    ctx.queue
        .enqueue(&ctx.incremental_candidate(&repo, Some("41")), 10, t0())
        .await
        .unwrap();

    let worker = Uuid::new_v4();
    let job = ctx.queue.claim(worker, t0()).await.unwrap().unwrap();
    ctx.queue.mark_running(&job, worker, t0()).await.unwrap();
    let done_at = t0() + Duration::seconds(5);
    ctx.queue
        .ack_success(&job, Some("42".to_string()), done_at)
        .await
        .unwrap();

    let state = ctx
        .repos
        .find_sync_state(repo.id, JobType::Incremental)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.watermark.as_deref(), Some("42"));
    assert_eq!(state.last_synced_at, Some(done_at));
    assert_eq!(state.last_job_id, Some(job.id));

    let stored = ctx.jobs.find_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Success);
    assert_eq!(stored.finished_at, Some(done_at));
}

#[tokio::test]
async fn test_backfill_success_keeps_watermark_unless_requested() {
    let ctx = TestContext::new().await;
    let mut repo = repo_fixture("alpha", None);
    repo.job_types = vec![JobType::Incremental, JobType::Backfill];
    let repo = ctx.repos.create(&repo).await.unwrap();

    ctx.repos
        .save_sync_state(&RepoSyncState {
            repo_id: repo.id,
            job_type: JobType::Backfill,
            watermark: Some("10".to_string()),
            last_synced_at: None,
            last_job_id: None,
            updated_at: t0(),
        })
        .await
        .unwrap();

    let mut candidate = ctx.incremental_candidate(&repo, None);
    candidate.job_type = JobType::Backfill;
    candidate.payload = JobPayload::Backfill {
        since: t0() - Duration::days(7),
        until: t0(),
        update_watermark: false,
    };
    ctx.queue.enqueue(&candidate, 1, t0()).await.unwrap();

    let worker = Uuid::new_v4();
    let job = ctx.queue.claim(worker, t0()).await.unwrap().unwrap();
    ctx.queue
        .ack_success(&job, Some("99".to_string()), t0())
        .await
        .unwrap();

    let state = ctx
        .repos
        .find_sync_state(repo.id, JobType::Backfill)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.watermark.as_deref(), Some("10"));
    assert_eq!(state.last_synced_at, Some(t0()));
}

#[tokio::test]
async fn test_retryable_failures_back_off_then_die() {
    let ctx = TestContext::new().await;
    let repo = ctx.add_repo("alpha", None).await;
    let candidate = ctx.incremental_candidate(&repo, None);
    let job = ctx.queue.enqueue(&candidate, 10, t0()).await.unwrap();
    let worker = Uuid::new_v4();

    let mut now = t0();
    for (attempt, backoff_secs) in [(1, 30), (2, 60)] {
        let claimed = ctx.queue.claim(worker, now).await.unwrap().unwrap();
        let status = ctx
            .queue
            .ack_failure(&claimed, "upstream 502", true, now)
            .await
            .unwrap();
        assert_eq!(status, JobStatus::Queued);

        let stored = ctx.jobs.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(stored.attempt_count, attempt);
        assert_eq!(stored.scheduled_for, now + Duration::seconds(backoff_secs));
        assert_eq!(stored.last_error.as_deref(), Some("upstream 502"));
        assert!(stored.claimed_by.is_none());

        // 退避期内不可认领
        assert!(ctx.queue.claim(worker, now + Duration::seconds(1)).await.unwrap().is_none());
        now = stored.scheduled_for;
    }

    let claimed = ctx.queue.claim(worker, now).await.unwrap().unwrap();
    let status = ctx
        .queue
        .ack_failure(&claimed, "upstream 502", true, now)
        .await
        .unwrap();
    assert_eq!(status, JobStatus::Dead);

    let stored = ctx.jobs.find_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Dead);
    assert_eq!(stored.attempt_count, 3);
    assert_eq!(stored.finished_at, Some(now));
    assert!(ctx.queue.active_jobs().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_non_retryable_failure_is_dead_immediately() {
    let ctx = TestContext::new().await;
    let repo = ctx.add_repo("alpha", None).await;
    ctx.queue
        .enqueue(&ctx.incremental_candidate(&repo, None), 10, t0())
        .await
        .unwrap();

    let job = ctx.queue.claim(Uuid::new_v4(), t0()).await.unwrap().unwrap();
    let status = ctx
        .queue
        .ack_failure(&job, "repository not found", false, t0())
        .await
        .unwrap();
    assert_eq!(status, JobStatus::Dead);

    let stored = ctx.repos.find_by_id(repo.id).await.unwrap().unwrap();
    assert_eq!(stored.failure_streak, 1);
}

#[tokio::test]
async fn test_ack_after_reclaim_is_rejected() {
    let ctx = TestContext::new().await;
    let repo = ctx.add_repo("alpha", None).await;
    ctx.queue
        .enqueue(&ctx.incremental_candidate(&repo, None), 10, t0())
        .await
        .unwrap();

    let job = ctx.queue.claim(Uuid::new_v4(), t0()).await.unwrap().unwrap();
    let requeued = ctx
        .queue
        .requeue_stale(Duration::seconds(60), t0() + Duration::seconds(61))
        .await
        .unwrap();
    assert_eq!(requeued.len(), 1);

    let err = ctx
        .queue
        .ack_success(&job, Some("42".to_string()), t0() + Duration::seconds(62))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::NotHeld(id) if id == job.id));
    assert!(ctx
        .repos
        .find_sync_state(repo.id, JobType::Incremental)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_failed_acks_open_the_breaker_and_success_resets_streak() {
    let breaker = CircuitBreakerConfig {
        failure_threshold: 2,
        ..Default::default()
    };
    let ctx = TestContext::with_configs(breaker, BucketConfig::default()).await;
    let first = ctx.add_repo("alpha", None).await;
    let second = ctx.add_repo("beta", None).await;

    for repo in [&first, &second] {
        ctx.queue
            .enqueue(&ctx.incremental_candidate(repo, None), 10, t0())
            .await
            .unwrap();
        let job = ctx.queue.claim(Uuid::new_v4(), t0()).await.unwrap().unwrap();
        ctx.queue
            .ack_failure(&job, "timeout", true, t0())
            .await
            .unwrap();
    }

    let key = ctx
        .breaker
        .key_for(&first.instance_id, first.id, JobType::Incremental);
    let view = ctx.breaker.snapshot(&key, t0()).await.unwrap();
    assert_eq!(view.status, CircuitStatus::Open);

    // 成功确认会清零仓库的连续失败次数
    let retry_at = t0() + Duration::seconds(30);
    let job = ctx.queue.claim(Uuid::new_v4(), retry_at).await.unwrap().unwrap();
    ctx.queue.ack_success(&job, None, retry_at).await.unwrap();
    let stored = ctx.repos.find_by_id(job.repo_id).await.unwrap().unwrap();
    assert_eq!(stored.failure_streak, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_hand_out_each_job_once() {
    let ctx = TestContext::new().await;
    for name in ["alpha", "beta", "gamma"] {
        let repo = ctx.add_repo(name, None).await;
        ctx.queue
            .enqueue(&ctx.incremental_candidate(&repo, None), 10, t0())
            .await
            .unwrap();
    }

    let queue = ctx.queue.clone();
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.claim(Uuid::new_v4(), t0()).await })
        })
        .collect();

    let mut claimed = Vec::new();
    for result in futures::future::join_all(handles).await {
        match result.unwrap() {
            Ok(Some(job)) => claimed.push(job.id),
            Ok(None) | Err(QueueError::ClaimConflict(_)) => {}
            Err(e) => panic!("unexpected claim error: {}", e),
        }
    }

    let unique: HashSet<Uuid> = claimed.iter().copied().collect();
    assert_eq!(claimed.len(), 3);
    assert_eq!(unique.len(), 3);
}

#[tokio::test]
async fn test_cancelled_ack_requeues_without_tripping_breaker() {
    let breaker = CircuitBreakerConfig {
        failure_threshold: 1,
        ..Default::default()
    };
    let ctx = TestContext::with_configs(breaker, BucketConfig::default()).await;
    let repo = ctx.add_repo("alpha", None).await;
    ctx.queue
        .enqueue(&ctx.incremental_candidate(&repo, None), 10, t0())
        .await
        .unwrap();

    let job = ctx.queue.claim(Uuid::new_v4(), t0()).await.unwrap().unwrap();
    let status = ctx
        .queue
        .ack_cancelled(&job, "Execution cancelled", t0())
        .await
        .unwrap();
    assert_eq!(status, JobStatus::Queued);

    let stored = ctx.jobs.find_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(stored.attempt_count, 1);
    assert!(stored.claimed_by.is_none());

    let key = ctx
        .breaker
        .key_for(&repo.instance_id, repo.id, JobType::Incremental);
    let view = ctx.breaker.snapshot(&key, t0()).await.unwrap();
    assert_eq!(view.status, CircuitStatus::Closed);
}

#[tokio::test]
async fn test_heartbeat_keeps_running_job_from_being_reclaimed() {
    let ctx = TestContext::new().await;
    let repo = ctx.add_repo("alpha", None).await;
    ctx.queue
        .enqueue(&ctx.incremental_candidate(&repo, None), 10, t0())
        .await
        .unwrap();

    let worker = Uuid::new_v4();
    let job = ctx.queue.claim(worker, t0()).await.unwrap().unwrap();
    ctx.queue.mark_running(&job, worker, t0()).await.unwrap();

    // 执行两分钟，每 20 秒续约一次
    for secs in (20..=120).step_by(20) {
        ctx.queue
            .heartbeat(&job, worker, t0() + Duration::seconds(secs))
            .await
            .unwrap();
    }
    let requeued = ctx
        .queue
        .requeue_stale(Duration::seconds(60), t0() + Duration::seconds(121))
        .await
        .unwrap();
    assert!(requeued.is_empty());
    assert!(ctx
        .queue
        .claim(Uuid::new_v4(), t0() + Duration::seconds(121))
        .await
        .unwrap()
        .is_none());

    // 其他 worker 不能续约
    let err = ctx
        .queue
        .heartbeat(&job, Uuid::new_v4(), t0() + Duration::seconds(122))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::NotHeld(id) if id == job.id));

    ctx.queue
        .ack_success(&job, None, t0() + Duration::seconds(130))
        .await
        .unwrap();
}
