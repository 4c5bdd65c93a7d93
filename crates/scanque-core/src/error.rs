//! 错误类型
use thiserror::Error;

/// 入队失败；被拒绝的事件随错误一并退回，由调用方决定是否重试
#[derive(Debug, Error)]
pub enum EnqueueError<T> {
    /// 队列存储扩容失败，事件未入队
    #[error("event queue allocation failed, event dropped")]
    OutOfMemory(T),
    /// 有界队列已满（DropNewest 策略）
    #[error("event queue is full, event dropped")]
    Full(T),
    /// 队列已关闭（子系统未启动或已停机）
    #[error("event queue is closed")]
    Closed(T),
}

impl<T> EnqueueError<T> {
    /// 取回被拒绝的事件
    pub fn into_inner(self) -> T {
        match self {
            EnqueueError::OutOfMemory(t) | EnqueueError::Full(t) | EnqueueError::Closed(t) => t,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, EnqueueError::Closed(_))
    }
}

/// 启动调度子系统失败
#[derive(Debug, Error)]
pub enum StartError {
    #[error("dispatch subsystem is already running")]
    AlreadyRunning,
    #[error("invalid dispatch options: {0}")]
    InvalidOptions(String),
    #[error("failed to build worker pool")]
    Pool(#[from] rayon::ThreadPoolBuildError),
    #[error("failed to spawn dispatch thread")]
    Spawn(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_record_is_returned() {
        let oom = EnqueueError::OutOfMemory("a");
        assert!(!oom.is_closed());
        assert_eq!(oom.to_string(), "event queue allocation failed, event dropped");
        assert_eq!(oom.into_inner(), "a");

        assert!(!EnqueueError::Full(1).is_closed());
        assert!(EnqueueError::Closed(2).is_closed());
        assert_eq!(EnqueueError::Full(3).into_inner(), 3);
    }
}
