// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::queue::sync_queue::SyncQueue;
use crate::utils::errors::WorkerError;
use crate::workers::worker::Worker;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// 回收器配置
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// 扫描间隔
    pub interval: Duration,
    /// 认领超过该时长仍未确认的任务视为被遗弃
    pub claim_timeout: chrono::Duration,
    /// 回收次数上限
    pub reclaim_limit: i32,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            claim_timeout: chrono::Duration::seconds(60),
            reclaim_limit: 3,
        }
    }
}

/// 单次扫描的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub requeued: Vec<Uuid>,
    pub escalated: Vec<Uuid>,
}

/// 遗弃任务回收器
///
/// 定期把认领超时的任务放回队列，并将反复被回收的任务转为 Dead
pub struct ReaperWorker {
    queue: Arc<dyn SyncQueue>,
    config: ReaperConfig,
}

impl ReaperWorker {
    pub fn new(queue: Arc<dyn SyncQueue>, config: ReaperConfig) -> Self {
        Self { queue, config }
    }

    /// 执行一次扫描
    ///
    /// # 参数
    ///
    /// * `now` - 扫描时间，认领时间早于 `now - claim_timeout` 的任务会被回收
    pub async fn reap_once(&self, now: DateTime<Utc>) -> Result<ReapReport, WorkerError> {
        let requeued = self
            .queue
            .requeue_stale(self.config.claim_timeout, now)
            .await?;
        if !requeued.is_empty() {
            warn!(
                "Requeued {} stale jobs: {:?}",
                requeued.len(),
                requeued.iter().map(|j| j.id).collect::<Vec<_>>()
            );
        }

        let escalated = self
            .queue
            .escalate_reclaimed(self.config.reclaim_limit, now)
            .await?;
        for job in &escalated {
            error!(
                job_id = %job.id,
                repo_id = %job.repo_id,
                job_type = %job.job_type,
                attempts = job.attempt_count,
                "Job exceeded reclaim limit and was marked dead"
            );
        }

        Ok(ReapReport {
            requeued: requeued.into_iter().map(|j| j.id).collect(),
            escalated: escalated.into_iter().map(|j| j.id).collect(),
        })
    }
}

#[async_trait]
impl Worker for ReaperWorker {
    async fn run(&self, cancel: CancellationToken) -> Result<(), WorkerError> {
        info!("Reaper started with interval {:?}", self.config.interval);

        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.reap_once(Utc::now()).await {
                        error!("Failed to reap stale jobs: {}", e);
                    }
                }
            }
        }

        info!("Reaper stopped");
        Ok(())
    }

    fn name(&self) -> &str {
        "reaper"
    }
}
