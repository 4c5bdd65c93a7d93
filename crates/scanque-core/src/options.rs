//! 调度选项与统计信息（模块）
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 空闲时调度线程的等待方式
/// - Poll：非阻塞取队列，空则固定睡眠 `idle_backoff` 后重试（最简单，空闲也有少量 CPU 开销）。
/// - Notify：在条件变量上等待，入队或停机立即唤醒；每轮最长等待 `idle_backoff`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WakeMode {
    Poll,
    Notify,
}

/// 有界队列写满时的处理策略
/// - Block：生产者阻塞直到有空位或队列关闭
/// - DropOldest：丢弃队头最旧事件，接收新事件
/// - DropNewest：拒绝新事件（`EnqueueError::Full`），所有权退回调用方
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    Block,
    DropOldest,
    DropNewest,
}

/// 调度子系统选项
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// 工作线程数：None 表示自动（等于 CPU 核数）
    pub max_threads: Option<usize>,
    /// 空闲退避间隔（默认 1ms）
    pub idle_backoff: Duration,
    /// 空闲等待方式
    pub wake_mode: WakeMode,
    /// 队列容量：None 表示不设上限
    pub capacity: Option<usize>,
    /// 写满策略（仅在有界时生效）
    pub overflow: OverflowPolicy,
    /// 停机时等待在途任务完成的最长时间
    pub shutdown_grace: Duration,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            max_threads: None,
            idle_backoff: Duration::from_millis(1),
            wake_mode: WakeMode::Notify,
            capacity: None,
            overflow: OverflowPolicy::DropNewest,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl DispatchOptions {
    /// 实际使用的工作线程数
    pub fn worker_count(&self) -> usize {
        self.max_threads.unwrap_or_else(num_cpus::get)
    }

    /// 校验选项；返回值为可读的错误描述
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.max_threads == Some(0) {
            return Err("max_threads must be at least 1".into());
        }
        if self.capacity == Some(0) {
            return Err("capacity must be at least 1 when set".into());
        }
        if self.idle_backoff.is_zero() {
            return Err("idle_backoff must be non-zero".into());
        }
        Ok(())
    }
}

/// 一次运行结束后的统计（便于 CLI 打印）
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    /// 提交给工作池的事件数
    pub dispatched: u64,
    /// 空闲轮询次数（取队列为空的次数）
    pub idle_polls: u64,
    /// 因溢出策略被丢弃的事件数
    pub dropped_on_overflow: u64,
    /// 停机时仍在队列中、被丢弃的事件数
    pub discarded_on_shutdown: usize,
    /// 宽限期结束仍未完成、被放弃的任务数
    pub abandoned_in_flight: usize,
    /// 扫描例程 panic 的次数
    pub scan_panics: u64,
    /// 队列历史最大长度
    pub queue_high_water: usize,
}
