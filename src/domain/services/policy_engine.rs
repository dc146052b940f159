// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::domain::models::bucket::InstanceBucketStatus;
use crate::domain::models::budget::{BudgetSnapshot, GLOBAL_BUDGET_KEY};
use crate::domain::models::circuit_breaker::{BreakerView, CircuitStatus};
use crate::domain::models::sync_job::{JobType, SyncJob, SyncJobCandidate};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use uuid::Uuid;

/// 令牌不足时的默认优先级惩罚
pub const BUCKET_LOW_TOKENS_PRIORITY_PENALTY: i32 = 5;

/// 默认低令牌阈值
pub const DEFAULT_LOW_TOKENS_THRESHOLD: f64 = 5.0;

/// 跳过原因
///
/// 序列化后的字符串是稳定的对外契约
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    DuplicateActiveJob,
    CircuitOpen,
    ProbeInFlight,
    BucketPaused,
    BudgetExceeded,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::DuplicateActiveJob => "duplicate_active_job",
            SkipReason::CircuitOpen => "circuit_open",
            SkipReason::ProbeInFlight => "probe_in_flight",
            SkipReason::BucketPaused => "bucket_paused",
            SkipReason::BudgetExceeded => "budget_exceeded",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 被跳过的候选
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedCandidate {
    pub repo_id: Uuid,
    pub job_type: JobType,
    pub reason: SkipReason,
}

impl SkippedCandidate {
    pub fn new(candidate: &SyncJobCandidate, reason: SkipReason) -> Self {
        Self {
            repo_id: candidate.repo_id,
            job_type: candidate.job_type,
            reason,
        }
    }
}

/// 被接纳的候选
#[derive(Debug, Clone, PartialEq)]
pub struct AdmittedJob {
    pub candidate: SyncJobCandidate,
    pub effective_priority: i32,
    /// 是否作为半开熔断器的探测任务
    pub is_probe: bool,
}

/// 策略引擎的决策结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolicyDecision {
    /// 按接纳顺序排列
    pub admitted: Vec<AdmittedJob>,
    pub skipped: Vec<SkippedCandidate>,
}

/// 策略配置
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    /// 全局并发上限，所有归属共享
    pub max_concurrent_jobs: usize,
    /// 没有显式预算快照的归属使用的并发上限
    pub max_concurrent_per_owner: usize,
    /// 令牌数低于该值时施加优先级惩罚
    pub low_tokens_threshold: f64,
    pub low_tokens_penalty: i32,
    /// 令牌桶暂停时直接跳过的任务类型
    pub skip_on_pause: HashSet<JobType>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 64,
            max_concurrent_per_owner: 8,
            low_tokens_threshold: DEFAULT_LOW_TOKENS_THRESHOLD,
            low_tokens_penalty: BUCKET_LOW_TOKENS_PRIORITY_PENALTY,
            skip_on_pause: HashSet::from([JobType::Backfill]),
        }
    }
}

impl PolicyConfig {
    pub fn skips_on_pause(&self, job_type: JobType) -> bool {
        self.skip_on_pause.contains(&job_type)
    }
}

/// 计算令牌桶带来的优先级惩罚
///
/// 令牌低于阈值（含零令牌）时返回 `low_tokens_penalty`，否则为 0。
/// 没有令牌桶记录的实例视为满桶。
pub fn calculate_bucket_priority_penalty(
    status: Option<&InstanceBucketStatus>,
    config: &PolicyConfig,
) -> i32 {
    match status {
        Some(bucket) if bucket.tokens < config.low_tokens_threshold => config.low_tokens_penalty,
        _ => 0,
    }
}

struct Ranked {
    candidate: SyncJobCandidate,
    effective_priority: i32,
}

/// 优先级降序，等待时间降序，最后按 (repo_id, job_type) 升序
fn rank_order(a: &Ranked, b: &Ranked) -> Ordering {
    b.effective_priority
        .cmp(&a.effective_priority)
        .then_with(|| b.candidate.staleness_age.cmp(&a.candidate.staleness_age))
        .then_with(|| a.candidate.repo_id.cmp(&b.candidate.repo_id))
        .then_with(|| a.candidate.job_type.cmp(&b.candidate.job_type))
}

/// 选择本次节拍需要入队的任务
///
/// 依次执行候选去重、活跃任务去重、熔断检查，然后在各归属之间轮转接纳。
/// 接纳时检查探测名额、预算与本节拍剩余令牌，每接纳一个任务扣减一个令牌。
/// 纯函数，不产生任何副作用。
///
/// # 参数
///
/// * `candidates` - 本次节拍计算出的候选
/// * `active_jobs` - 当前活跃任务
/// * `budgets` - 按归属索引的预算快照，`"*"` 为全局预算
/// * `bucket_status` - 按上游实例索引的令牌桶状态
/// * `breaker_states` - 按熔断键索引的熔断器视图
/// * `config` - 策略配置
/// * `now` - 当前时间
///
/// # 返回值
///
/// 接纳与跳过的候选，每个输入候选恰好出现一次
pub fn select_jobs_to_enqueue(
    candidates: Vec<SyncJobCandidate>,
    active_jobs: &[SyncJob],
    budgets: &HashMap<String, BudgetSnapshot>,
    bucket_status: &HashMap<String, InstanceBucketStatus>,
    breaker_states: &HashMap<String, BreakerView>,
    config: &PolicyConfig,
    now: DateTime<Utc>,
) -> PolicyDecision {
    let mut decision = PolicyDecision::default();

    // 候选之间去重，等待更久的胜出
    let mut unique: Vec<SyncJobCandidate> = Vec::with_capacity(candidates.len());
    let mut index: HashMap<(Uuid, JobType), usize> = HashMap::new();
    for candidate in candidates {
        let key = (candidate.repo_id, candidate.job_type);
        match index.get(&key) {
            Some(&pos) if unique[pos].staleness_age >= candidate.staleness_age => {
                decision
                    .skipped
                    .push(SkippedCandidate::new(&candidate, SkipReason::DuplicateActiveJob));
            }
            Some(&pos) => {
                let loser = std::mem::replace(&mut unique[pos], candidate);
                decision
                    .skipped
                    .push(SkippedCandidate::new(&loser, SkipReason::DuplicateActiveJob));
            }
            None => {
                index.insert(key, unique.len());
                unique.push(candidate);
            }
        }
    }

    let active: HashSet<(Uuid, JobType)> = active_jobs
        .iter()
        .filter(|job| job.status.is_active())
        .map(|job| (job.repo_id, job.job_type))
        .collect();

    let mut eligible: Vec<Ranked> = Vec::with_capacity(unique.len());
    let mut half_open_keys: HashSet<String> = HashSet::new();
    for candidate in unique {
        if active.contains(&(candidate.repo_id, candidate.job_type)) {
            decision
                .skipped
                .push(SkippedCandidate::new(&candidate, SkipReason::DuplicateActiveJob));
            continue;
        }

        let breaker = breaker_states
            .get(&candidate.breaker_key)
            .copied()
            .unwrap_or_default();
        match breaker.status {
            CircuitStatus::Open => {
                decision
                    .skipped
                    .push(SkippedCandidate::new(&candidate, SkipReason::CircuitOpen));
                continue;
            }
            CircuitStatus::HalfOpen if breaker.probe_in_flight => {
                decision
                    .skipped
                    .push(SkippedCandidate::new(&candidate, SkipReason::ProbeInFlight));
                continue;
            }
            CircuitStatus::HalfOpen => {
                half_open_keys.insert(candidate.breaker_key.clone());
            }
            CircuitStatus::Closed => {}
        }

        // 排序使用节拍开始时的令牌数，接纳时再按剩余令牌复核
        let bucket = bucket_status.get(&candidate.instance_id);
        let effective_priority =
            candidate.base_priority - calculate_bucket_priority_penalty(bucket, config);
        eligible.push(Ranked {
            candidate,
            effective_priority,
        });
    }

    eligible.sort_by(rank_order);

    // 按归属分组，保持排序；归属的顺序由其最优候选决定
    let mut owners: Vec<String> = Vec::new();
    let mut queues: HashMap<String, VecDeque<Ranked>> = HashMap::new();
    for entry in eligible {
        let owner = entry.candidate.budget_key.clone();
        if !queues.contains_key(&owner) {
            owners.push(owner.clone());
        }
        queues.entry(owner).or_default().push_back(entry);
    }

    let global = budgets.get(GLOBAL_BUDGET_KEY).cloned().unwrap_or_else(|| {
        BudgetSnapshot::new(
            GLOBAL_BUDGET_KEY,
            config.max_concurrent_jobs,
            active_jobs.iter().filter(|j| j.status.is_active()).count(),
        )
    });
    let mut owner_admitted: HashMap<String, usize> = HashMap::new();
    let mut total_admitted = 0usize;
    // 本次节拍内的剩余令牌，每接纳一个任务扣减一个
    let mut tokens: HashMap<String, InstanceBucketStatus> = HashMap::new();
    let mut probes: HashSet<String> = HashSet::new();

    loop {
        let mut progressed = false;
        for owner in &owners {
            let Some(entry) = queues.get_mut(owner).and_then(|q| q.pop_front()) else {
                continue;
            };
            progressed = true;

            let is_probe = half_open_keys.contains(&entry.candidate.breaker_key);
            if is_probe && probes.contains(&entry.candidate.breaker_key) {
                decision
                    .skipped
                    .push(SkippedCandidate::new(&entry.candidate, SkipReason::ProbeInFlight));
                continue;
            }

            let budget = budgets.get(owner).cloned().unwrap_or_else(|| {
                let in_flight = active_jobs
                    .iter()
                    .filter(|j| j.status.is_active() && &j.budget_key == owner)
                    .count();
                BudgetSnapshot::new(owner.clone(), config.max_concurrent_per_owner, in_flight)
            });
            let admitted_for_owner = owner_admitted.get(owner).copied().unwrap_or(0);

            if !budget.has_room(admitted_for_owner) || !global.has_room(total_admitted) {
                decision
                    .skipped
                    .push(SkippedCandidate::new(&entry.candidate, SkipReason::BudgetExceeded));
                continue;
            }

            let instance = &entry.candidate.instance_id;
            if !tokens.contains_key(instance) {
                if let Some(status) = bucket_status.get(instance) {
                    tokens.insert(instance.clone(), status.clone());
                }
            }
            let bucket = tokens.get(instance);
            if bucket.is_some_and(|b| b.is_paused(now))
                && config.skips_on_pause(entry.candidate.job_type)
            {
                decision
                    .skipped
                    .push(SkippedCandidate::new(&entry.candidate, SkipReason::BucketPaused));
                continue;
            }
            let effective_priority =
                entry.candidate.base_priority - calculate_bucket_priority_penalty(bucket, config);

            if let Some(bucket) = tokens.get_mut(instance) {
                bucket.take_token();
            }
            if is_probe {
                probes.insert(entry.candidate.breaker_key.clone());
            }
            owner_admitted.insert(owner.clone(), admitted_for_owner + 1);
            total_admitted += 1;
            decision.admitted.push(AdmittedJob {
                candidate: entry.candidate,
                effective_priority,
                is_probe,
            });
        }
        if !progressed {
            break;
        }
    }

    decision
}
