// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use anyhow::Context;
use backoff::ExponentialBackoff;
use chrono::Utc;
use migration::{Migrator, MigratorTrait};
use scmsync::config::settings::{Settings, StateStoreBackend};
use scmsync::domain::repositories::state_store::StateStore;
use scmsync::domain::services::circuit_breaker::CircuitBreakerController;
use scmsync::domain::services::rate_limit_bucket::RateLimitBucket;
use scmsync::infrastructure::cache::memory_state_store::MemoryStateStore;
use scmsync::infrastructure::cache::redis_client::RedisClient;
use scmsync::infrastructure::cache::redis_state_store::RedisStateStore;
use scmsync::infrastructure::database::connection;
use scmsync::infrastructure::executors::command_executor::CommandExecutor;
use scmsync::infrastructure::metrics::init_metrics;
use scmsync::infrastructure::repositories::repo_repo_impl::RepoRepositoryImpl;
use scmsync::infrastructure::repositories::sync_job_repo_impl::SyncJobRepositoryImpl;
use scmsync::queue::scheduler::SyncScheduler;
use scmsync::queue::sync_queue::{PersistentSyncQueue, SyncQueue};
use scmsync::utils::telemetry;
use scmsync::workers::manager::WorkerManager;
use scmsync::workers::reaper_worker::{ReaperConfig, ReaperWorker};
use scmsync::workers::sync_worker::{SyncWorker, SyncWorkerConfig};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const STATE_KEY_PREFIX: &str = "scmsync:";

/// 运行模式，取自第一个命令行参数或 `SCMSYNC_MODE`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    /// 执行一次调度节拍后退出
    Once,
    /// 连续执行调度节拍
    Loop,
    /// 只输出决策，不写入队列
    DryRun,
    /// 运行 worker 与回收器
    Worker,
    /// 调度循环、worker 与回收器
    All,
}

impl FromStr for RunMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "once" => Ok(RunMode::Once),
            "loop" => Ok(RunMode::Loop),
            "dry_run" | "dry-run" => Ok(RunMode::DryRun),
            "worker" => Ok(RunMode::Worker),
            "all" => Ok(RunMode::All),
            other => anyhow::bail!(
                "unknown mode '{}', expected once|loop|dry_run|worker|all",
                other
            ),
        }
    }
}

/// 主函数
///
/// 应用程序入口点，负责初始化所有组件并按运行模式启动
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Initialize logging
    telemetry::init_telemetry();

    let mode: RunMode = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("SCMSYNC_MODE").ok())
        .unwrap_or_else(|| "once".to_string())
        .parse()?;
    info!("Starting scmsync in {:?} mode", mode);

    // 2. Load configuration
    let settings = Settings::new().context("failed to load configuration")?;
    info!("Configuration loaded");

    if settings.metrics.enabled && matches!(mode, RunMode::Loop | RunMode::Worker | RunMode::All) {
        init_metrics(&settings.metrics);
    }

    // 3. Connect to database
    let db = backoff::future::retry(
        ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(60)),
            ..Default::default()
        },
        || async {
            connection::create_pool(&settings.database)
                .await
                .map_err(|e| {
                    warn!("Database connection failed, retrying: {}", e);
                    backoff::Error::transient(e)
                })
        },
    )
    .await
    .context("failed to connect to database")?;
    let db = Arc::new(db);
    info!("Database connection established");

    Migrator::up(db.as_ref(), None)
        .await
        .context("failed to apply migrations")?;
    info!("Database migrations applied");

    // 4. Initialize state store
    let store: Arc<dyn StateStore> = match settings.state_store.backend {
        StateStoreBackend::Redis => {
            let client = RedisClient::new(&settings.redis.url)?;
            client.ping().await.context("redis is unreachable")?;
            info!("Redis state store initialized");
            Arc::new(RedisStateStore::new(client, STATE_KEY_PREFIX))
        }
        StateStoreBackend::Memory => {
            warn!("Using in-memory state store, breaker and bucket state is not shared");
            Arc::new(MemoryStateStore::new())
        }
    };

    // 5. Initialize components
    let breaker = CircuitBreakerController::new(store.clone(), settings.breaker_config());
    let bucket = RateLimitBucket::new(store.clone(), settings.bucket_config());
    let job_repo = Arc::new(SyncJobRepositoryImpl::new(db.clone()));
    let repo_repo = Arc::new(RepoRepositoryImpl::new(db.clone()));
    let queue: Arc<dyn SyncQueue> = Arc::new(PersistentSyncQueue::new(
        job_repo,
        breaker.clone(),
        settings.retry_policy(),
        settings.max_attempts(),
    ));
    let scheduler = Arc::new(SyncScheduler::new(
        repo_repo,
        queue.clone(),
        breaker,
        bucket.clone(),
        store,
        settings.scheduler_config(),
    ));

    let cancel = CancellationToken::new();

    match mode {
        RunMode::Once | RunMode::DryRun => {
            let result = scheduler
                .run_tick(Utc::now(), mode == RunMode::DryRun)
                .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        RunMode::Loop => {
            let interval = Duration::from_secs(settings.scheduler.tick_interval_secs);
            let loop_cancel = cancel.clone();
            let handle =
                tokio::spawn(async move { scheduler.run_loop(interval, loop_cancel).await });
            tokio::signal::ctrl_c().await?;
            info!("Shutdown signal received");
            cancel.cancel();
            handle.await?;
        }
        RunMode::Worker | RunMode::All => {
            let mut manager = WorkerManager::new(cancel.clone());

            let command = settings
                .executor
                .command
                .clone()
                .context("executor.command must be set to run workers")?;
            let executor = Arc::new(CommandExecutor::new(command, settings.executor.args.clone()));
            let worker_config = SyncWorkerConfig {
                poll_interval: Duration::from_millis(settings.worker.poll_interval_ms),
                execution_timeout: Duration::from_secs(settings.worker.execution_timeout_secs),
                heartbeat_interval: Duration::from_secs(settings.worker.heartbeat_interval_secs),
            };
            for _ in 0..settings.worker.concurrency {
                manager.spawn(Arc::new(SyncWorker::new(
                    queue.clone(),
                    executor.clone(),
                    bucket.clone(),
                    worker_config.clone(),
                )));
            }
            manager.spawn(Arc::new(ReaperWorker::new(
                queue.clone(),
                ReaperConfig {
                    interval: Duration::from_secs(settings.reaper.interval_secs),
                    claim_timeout: chrono::Duration::seconds(settings.reaper.claim_timeout_secs),
                    reclaim_limit: settings.reaper.reclaim_limit,
                },
            )));
            info!("Started {} background workers", manager.len());

            let scheduler_handle = (mode == RunMode::All).then(|| {
                let interval = Duration::from_secs(settings.scheduler.tick_interval_secs);
                let loop_cancel = cancel.clone();
                tokio::spawn(async move { scheduler.run_loop(interval, loop_cancel).await })
            });

            manager.wait_for_shutdown().await;
            if let Some(handle) = scheduler_handle {
                handle.await?;
            }
        }
    }

    Ok(())
}
