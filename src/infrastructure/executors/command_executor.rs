// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::domain::models::sync_job::{JobPayload, JobType};
use crate::domain::services::task_executor::{
    ExecutionOutcome, TaskExecutionError, TaskExecutor,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 外部程序报告上游限流时使用的退出码（EX_TEMPFAIL）
pub const EXIT_RATE_LIMITED: i32 = 75;
/// 外部程序报告不可重试失败时使用的退出码（EX_DATAERR）
pub const EXIT_PERMANENT: i32 = 65;

const DEFAULT_RETRY_AFTER_SECS: i64 = 60;
const STDERR_EXCERPT_LEN: usize = 512;

#[derive(Debug, Default, Deserialize)]
struct RateLimitReport {
    #[serde(default)]
    retry_after_secs: Option<i64>,
}

/// 通过外部程序执行同步
///
/// 负载 JSON 写入子进程标准输入，标准输出为 [`ExecutionOutcome`] JSON（可为空）。
/// 退出码 0 表示成功，75 表示上游限流，65 表示不可重试，其余视为可重试失败。
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn stderr_excerpt(stderr: &[u8]) -> String {
        let text = String::from_utf8_lossy(stderr);
        let text = text.trim();
        match text.char_indices().nth(STDERR_EXCERPT_LEN) {
            Some((idx, _)) => format!("{}...", &text[..idx]),
            None => text.to_string(),
        }
    }
}

#[async_trait]
impl TaskExecutor for CommandExecutor {
    async fn execute(
        &self,
        job_type: JobType,
        payload: &JobPayload,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome, TaskExecutionError> {
        let input = serde_json::to_vec(payload)
            .map_err(|e| TaskExecutionError::Permanent(format!("encode payload: {}", e)))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("SCMSYNC_JOB_TYPE", job_type.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TaskExecutionError::Failed(format!("spawn {}: {}", self.program, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&input)
                .await
                .map_err(|e| TaskExecutionError::Failed(format!("write stdin: {}", e)))?;
        }

        // 取消时丢弃 future，kill_on_drop 负责结束子进程
        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(TaskExecutionError::Cancelled),
            output = child.wait_with_output() => output
                .map_err(|e| TaskExecutionError::Failed(format!("wait {}: {}", self.program, e)))?,
        };

        let code = output.status.code();
        debug!("Executor {} exited with {:?}", self.program, code);

        match code {
            Some(0) => {
                if output.stdout.iter().all(u8::is_ascii_whitespace) {
                    return Ok(ExecutionOutcome::default());
                }
                serde_json::from_slice(&output.stdout).map_err(|e| {
                    TaskExecutionError::Permanent(format!("malformed executor output: {}", e))
                })
            }
            Some(EXIT_RATE_LIMITED) => {
                let report: RateLimitReport =
                    serde_json::from_slice(&output.stdout).unwrap_or_default();
                let secs = report
                    .retry_after_secs
                    .unwrap_or(DEFAULT_RETRY_AFTER_SECS)
                    .max(1);
                Err(TaskExecutionError::RateLimited {
                    retry_after: chrono::Duration::seconds(secs),
                })
            }
            Some(EXIT_PERMANENT) => Err(TaskExecutionError::Permanent(Self::stderr_excerpt(
                &output.stderr,
            ))),
            Some(other) => Err(TaskExecutionError::Failed(format!(
                "exit code {}: {}",
                other,
                Self::stderr_excerpt(&output.stderr)
            ))),
            None => {
                warn!("Executor {} terminated by signal", self.program);
                Err(TaskExecutionError::Failed("terminated by signal".to_string()))
            }
        }
    }
}
