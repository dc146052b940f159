// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::queue::sync_queue::QueueError;
use thiserror::Error;

/// Worker错误类型
///
/// 只包含基础设施错误，单个任务的执行失败记录在队列状态中
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("队列错误: {0}")]
    Queue(#[from] QueueError),
}
