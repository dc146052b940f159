// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use migration::{Migrator, MigratorTrait};
use scmsync::domain::models::repo::{Repo, ScmType};
use scmsync::domain::models::sync_job::{JobPayload, JobType, SyncJobCandidate};
use scmsync::domain::repositories::repo_repository::RepoRepository;
use scmsync::domain::repositories::state_store::StateStore;
use scmsync::domain::services::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerController};
use scmsync::domain::services::rate_limit_bucket::{BucketConfig, RateLimitBucket};
use scmsync::domain::services::task_executor::{
    ExecutionOutcome, TaskExecutionError, TaskExecutor,
};
use scmsync::infrastructure::cache::memory_state_store::MemoryStateStore;
use scmsync::infrastructure::repositories::repo_repo_impl::RepoRepositoryImpl;
use scmsync::infrastructure::repositories::sync_job_repo_impl::SyncJobRepositoryImpl;
use scmsync::queue::scheduler::{SchedulerConfig, SyncScheduler};
use scmsync::queue::sync_queue::PersistentSyncQueue;
use scmsync::utils::retry_policy::RetryPolicy;
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const INSTANCE: &str = "gitlab.example.com";

/// 测试使用的固定时间点
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap()
}

pub async fn setup_db() -> Arc<DatabaseConnection> {
    // 内存库每个连接独立，必须限制为单连接
    let mut opt = ConnectOptions::new("sqlite::memory:");
    opt.max_connections(1).min_connections(1).sqlx_logging(false);
    let db = Database::connect(opt).await.unwrap();
    Migrator::up(&db, None).await.unwrap();
    Arc::new(db)
}

/// 创建于 `t0` 之前 30 天的仓库
pub fn repo_fixture(name: &str, tenant: Option<&str>) -> Repo {
    let mut repo = Repo::new(name, ScmType::Gitlab, INSTANCE);
    repo.tenant_id = tenant.map(str::to_string);
    repo.created_at = t0() - chrono::Duration::days(30);
    repo.updated_at = repo.created_at;
    repo
}

#[allow(dead_code)]
pub struct TestContext {
    pub db: Arc<DatabaseConnection>,
    pub store: Arc<dyn StateStore>,
    pub repos: Arc<RepoRepositoryImpl>,
    pub jobs: Arc<SyncJobRepositoryImpl>,
    pub breaker: CircuitBreakerController,
    pub bucket: RateLimitBucket,
    pub queue: Arc<PersistentSyncQueue<SyncJobRepositoryImpl>>,
}

impl TestContext {
    pub async fn new() -> Self {
        Self::with_configs(CircuitBreakerConfig::default(), BucketConfig::default()).await
    }

    pub async fn with_configs(breaker: CircuitBreakerConfig, bucket: BucketConfig) -> Self {
        let db = setup_db().await;
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let repos = Arc::new(RepoRepositoryImpl::new(db.clone()));
        let jobs = Arc::new(SyncJobRepositoryImpl::new(db.clone()));
        let breaker = CircuitBreakerController::new(store.clone(), breaker);
        let bucket = RateLimitBucket::new(store.clone(), bucket);
        let queue = Arc::new(PersistentSyncQueue::new(
            jobs.clone(),
            breaker.clone(),
            RetryPolicy::deterministic(Duration::from_secs(30), Duration::from_secs(3600)),
            HashMap::from([(JobType::Incremental, 3), (JobType::Backfill, 3)]),
        ));

        Self {
            db,
            store,
            repos,
            jobs,
            breaker,
            bucket,
            queue,
        }
    }

    pub fn scheduler(&self, config: SchedulerConfig) -> SyncScheduler {
        SyncScheduler::new(
            self.repos.clone(),
            self.queue.clone(),
            self.breaker.clone(),
            self.bucket.clone(),
            self.store.clone(),
            config,
        )
    }

    /// 创建一个启用增量同步的仓库
    pub async fn add_repo(&self, name: &str, tenant: Option<&str>) -> Repo {
        self.repos
            .create(&repo_fixture(name, tenant))
            .await
            .unwrap()
    }

    pub fn incremental_candidate(&self, repo: &Repo, since: Option<&str>) -> SyncJobCandidate {
        SyncJobCandidate {
            repo_id: repo.id,
            instance_id: repo.instance_id.clone(),
            budget_key: repo.budget_key().to_string(),
            breaker_key: self
                .breaker
                .key_for(&repo.instance_id, repo.id, JobType::Incremental),
            job_type: JobType::Incremental,
            base_priority: 10,
            staleness_age: chrono::Duration::hours(48),
            payload: JobPayload::Incremental {
                since: since.map(str::to_string),
            },
        }
    }
}

/// 按顺序返回预设结果的执行器
pub struct ScriptedExecutor {
    results: Mutex<VecDeque<Result<ExecutionOutcome, TaskExecutionError>>>,
    pub calls: Mutex<Vec<JobPayload>>,
    delay: Option<Duration>,
}

impl ScriptedExecutor {
    pub fn new(results: Vec<Result<ExecutionOutcome, TaskExecutionError>>) -> Self {
        Self {
            results: Mutex::new(results.into()),
            calls: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// 每次执行都阻塞 `delay`，期间响应取消
    pub fn slow(delay: Duration) -> Self {
        Self {
            results: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            delay: Some(delay),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        _job_type: JobType,
        payload: &JobPayload,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome, TaskExecutionError> {
        self.calls.lock().unwrap().push(payload.clone());

        if let Some(delay) = self.delay {
            tokio::select! {
                _ = cancel.cancelled() => return Err(TaskExecutionError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(ExecutionOutcome::default()))
    }
}
