// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::workers::worker::Worker;
use futures::future::join_all;
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// 工作管理器
///
/// 启动一组后台工作器，共享同一个取消令牌
pub struct WorkerManager {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerManager {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            handles: Vec::new(),
        }
    }

    /// 启动工作器
    ///
    /// # 参数
    ///
    /// * `worker` - 要在独立任务中运行的工作器
    pub fn spawn(&mut self, worker: Arc<dyn Worker>) {
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = worker.run(cancel).await {
                error!("Worker {} exited with error: {}", worker.name(), e);
            }
        });
        self.handles.push(handle);
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// 触发取消并等待所有工作器退出
    pub async fn shutdown(&mut self) {
        info!("Shutting down workers...");
        self.cancel.cancel();
        for result in join_all(self.handles.drain(..)).await {
            if let Err(e) = result {
                error!("Worker task failed to join: {}", e);
            }
        }
        info!("Workers shut down successfully");
    }

    /// 等待关闭信号并关闭工作进程
    ///
    /// 收到 Ctrl-C 或令牌被外部取消时返回
    pub async fn wait_for_shutdown(&mut self) {
        tokio::select! {
            result = signal::ctrl_c() => match result {
                Ok(()) => info!("Shutdown signal received"),
                Err(err) => error!("Unable to listen for shutdown signal: {}", err),
            },
            _ = self.cancel.cancelled() => {}
        }
        self.shutdown().await;
    }
}
