// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use super::helpers::{t0, TestContext};
use chrono::Duration;
use scmsync::domain::models::sync_job::JobStatus;
use scmsync::domain::repositories::sync_job_repository::{
    SyncJobRepository, CLAIM_EXPIRED, RECLAIM_LIMIT_EXCEEDED,
};
use scmsync::queue::sync_queue::SyncQueue;
use scmsync::workers::reaper_worker::{ReaperConfig, ReaperWorker};
use uuid::Uuid;

fn reaper(ctx: &TestContext, reclaim_limit: i32) -> ReaperWorker {
    ReaperWorker::new(
        ctx.queue.clone(),
        ReaperConfig {
            interval: std::time::Duration::from_secs(30),
            claim_timeout: Duration::seconds(60),
            reclaim_limit,
        },
    )
}

#[tokio::test]
async fn test_reaper_requeues_only_expired_claims() {
    let ctx = TestContext::new().await;
    let repo = ctx.add_repo("alpha", None).await;
    ctx.queue
        .enqueue(&ctx.incremental_candidate(&repo, None), 10, t0())
        .await
        .unwrap();
    let job = ctx.queue.claim(Uuid::new_v4(), t0()).await.unwrap().unwrap();
    let reaper = reaper(&ctx, 3);

    let early = reaper.reap_once(t0() + Duration::seconds(30)).await.unwrap();
    assert!(early.requeued.is_empty());
    let stored = ctx.jobs.find_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Claimed);
    assert_eq!(stored.attempt_count, 0);

    let late = reaper.reap_once(t0() + Duration::seconds(61)).await.unwrap();
    assert_eq!(late.requeued, vec![job.id]);
    assert!(late.escalated.is_empty());

    let stored = ctx.jobs.find_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Queued);
    assert_eq!(stored.attempt_count, 1);
    assert_eq!(stored.last_error.as_deref(), Some(CLAIM_EXPIRED));
    assert!(stored.claimed_by.is_none());
    assert!(stored.claimed_at.is_none());
}

#[tokio::test]
async fn test_reaper_ignores_finished_jobs() {
    let ctx = TestContext::new().await;
    let repo = ctx.add_repo("alpha", None).await;
    ctx.queue
        .enqueue(&ctx.incremental_candidate(&repo, None), 10, t0())
        .await
        .unwrap();
    let job = ctx.queue.claim(Uuid::new_v4(), t0()).await.unwrap().unwrap();
    ctx.queue.ack_success(&job, None, t0()).await.unwrap();

    let report = reaper(&ctx, 3)
        .reap_once(t0() + Duration::hours(1))
        .await
        .unwrap();
    assert!(report.requeued.is_empty());
    let stored = ctx.jobs.find_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Success);
}

#[tokio::test]
async fn test_reaper_escalates_repeatedly_abandoned_job() {
    let ctx = TestContext::new().await;
    let repo = ctx.add_repo("alpha", None).await;
    let job = ctx
        .queue
        .enqueue(&ctx.incremental_candidate(&repo, None), 10, t0())
        .await
        .unwrap();
    let reaper = reaper(&ctx, 2);

    let mut now = t0();
    for round in 1..=3 {
        ctx.queue.claim(Uuid::new_v4(), now).await.unwrap().unwrap();
        now += Duration::seconds(61);
        let report = reaper.reap_once(now).await.unwrap();
        assert_eq!(report.requeued, vec![job.id]);
        if round < 3 {
            assert!(report.escalated.is_empty());
        } else {
            assert_eq!(report.escalated, vec![job.id]);
        }
    }

    let stored = ctx.jobs.find_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Dead);
    assert_eq!(stored.last_error.as_deref(), Some(RECLAIM_LIMIT_EXCEEDED));
    assert!(ctx.queue.active_jobs().await.unwrap().is_empty());
}
