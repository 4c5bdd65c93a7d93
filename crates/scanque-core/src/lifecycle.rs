//! 生命周期控制：启动调度线程、接收生产者事件、异步停机
//!
//! `DispatchSubsystem` 是显式对象，不使用进程级全局状态；同一进程可以有多个独立实例。
//! 停机完成（Stopped）后可以再次 `start`，每次运行都使用新的队列与工作池。
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info};

use crate::dispatch::{run_dispatch_loop, LoopConfig, Progress, Run, ScanRoutine, ShutdownHandle};
use crate::error::{EnqueueError, StartError};
use crate::options::{DispatchOptions, DispatchStats};
use crate::pool::{RayonPool, WorkerPool};
use crate::queue::EventQueue;
use crate::types::{DispatchState, ShutdownKind};

/// 调度线程名
const DISPATCH_THREAD_NAME: &str = "scan-queue";

struct ActiveRun<T> {
    run: Arc<Run<T>>,
    handle: Option<JoinHandle<DispatchStats>>,
}

/// 事件调度子系统：队列 + 单消费者调度线程 + 工作池
pub struct DispatchSubsystem<T: Send + 'static> {
    routine: ScanRoutine<T>,
    active: Mutex<Option<ActiveRun<T>>>,
}

impl<T: Send + 'static> DispatchSubsystem<T> {
    /// `routine` 在工作线程上对每个事件调用一次
    pub fn new<F>(routine: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Self { routine: Arc::new(routine), active: Mutex::new(None) }
    }

    /// 以 `opts.worker_count()` 个工作线程启动
    pub fn start(&self, opts: &DispatchOptions) -> Result<(), StartError> {
        opts.validate().map_err(StartError::InvalidOptions)?;
        let mut active = self.active.lock();
        reap_stopped(&mut active)?;
        let pool = RayonPool::new(opts.worker_count())?;
        self.launch(&mut active, opts, Box::new(pool))
    }

    /// 使用外部提供的工作池启动（`opts.max_threads` 被忽略）
    pub fn start_with_pool(&self, opts: &DispatchOptions, pool: Box<dyn WorkerPool>) -> Result<(), StartError> {
        opts.validate().map_err(StartError::InvalidOptions)?;
        let mut active = self.active.lock();
        reap_stopped(&mut active)?;
        self.launch(&mut active, opts, pool)
    }

    fn launch(
        &self,
        active: &mut Option<ActiveRun<T>>,
        opts: &DispatchOptions,
        pool: Box<dyn WorkerPool>,
    ) -> Result<(), StartError> {
        let run = Arc::new(Run::new(EventQueue::new(opts.capacity, opts.overflow)));
        let cfg = LoopConfig {
            idle_backoff: opts.idle_backoff,
            wake_mode: opts.wake_mode,
            shutdown_grace: opts.shutdown_grace,
        };
        info!(
            workers = pool.workers(),
            capacity = ?opts.capacity,
            overflow = ?opts.overflow,
            "initializing event queue consumer"
        );

        let handle = {
            let run = Arc::clone(&run);
            let routine = Arc::clone(&self.routine);
            thread::Builder::new()
                .name(DISPATCH_THREAD_NAME.into())
                .spawn(move || run_dispatch_loop(run, pool, routine, cfg))
                .map_err(|e| {
                    error!(error = %e, "unable to start event consumer thread");
                    StartError::Spawn(e)
                })?
        };
        *active = Some(ActiveRun { run, handle: Some(handle) });
        Ok(())
    }

    /// 提交一个事件；未启动或已停机时返回 `Closed`
    pub fn enqueue(&self, record: T) -> Result<(), EnqueueError<T>> {
        match self.current_run() {
            Some(run) => run.enqueue(record),
            None => Err(EnqueueError::Closed(record)),
        }
    }

    /// 绑定当前运行的生产者句柄（可克隆，交给各生产者线程）
    pub fn producer(&self) -> Option<EventProducer<T>> {
        self.current_run().map(|run| EventProducer { run })
    }

    /// 停机触发器，可交给信号监听线程
    pub fn shutdown_handle(&self) -> Option<ShutdownHandle> {
        self.current_run().map(|run| run.shutdown_handle())
    }

    /// 异步请求停机，立即返回；仅第一次请求返回 true
    pub fn request_shutdown(&self, kind: ShutdownKind) -> bool {
        match self.shutdown_handle() {
            Some(handle) => handle.trigger(kind),
            None => false,
        }
    }

    /// 等待调度线程结束并取回统计；已取回过或从未启动时返回 None
    pub fn wait(&self) -> Option<DispatchStats> {
        let (run, handle) = {
            let mut active = self.active.lock();
            let active = active.as_mut()?;
            (Arc::clone(&active.run), active.handle.take()?)
        };
        match handle.join() {
            Ok(stats) => Some(stats),
            Err(_) => {
                error!("event queue consumer thread panicked");
                run.shutdown_handle().trigger(ShutdownKind::Requested);
                run.set_state(DispatchState::Stopped);
                None
            }
        }
    }

    /// 请求停机并等待完成；重复调用返回 None
    pub fn shutdown(&self, kind: ShutdownKind) -> Option<DispatchStats> {
        self.request_shutdown(kind);
        self.wait()
    }

    pub fn state(&self) -> DispatchState {
        self.current_run().map_or(DispatchState::Stopped, |run| run.state())
    }

    /// 当前运行的进度；未启动时为 None
    pub fn progress(&self) -> Option<Progress> {
        self.current_run().map(|run| run.progress())
    }

    fn current_run(&self) -> Option<Arc<Run<T>>> {
        self.active.lock().as_ref().map(|a| Arc::clone(&a.run))
    }
}

/// 上一次运行已停止则回收其线程，否则拒绝启动
fn reap_stopped<T: Send + 'static>(active: &mut Option<ActiveRun<T>>) -> Result<(), StartError> {
    let Some(prev) = active.as_mut() else {
        return Ok(());
    };
    if prev.run.state() != DispatchState::Stopped {
        return Err(StartError::AlreadyRunning);
    }
    if let Some(handle) = prev.handle.take() {
        if handle.join().is_err() {
            error!("previous event queue consumer thread panicked");
        }
    }
    *active = None;
    Ok(())
}

impl<T: Send + 'static> Drop for DispatchSubsystem<T> {
    fn drop(&mut self) {
        self.request_shutdown(ShutdownKind::Requested);
        self.wait();
    }
}

impl<T: Send + 'static> std::fmt::Debug for DispatchSubsystem<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchSubsystem").field("state", &self.state()).finish()
    }
}

/// 生产者句柄：绑定某一次运行，停机后入队返回 `Closed`
pub struct EventProducer<T> {
    run: Arc<Run<T>>,
}

impl<T: Send + 'static> EventProducer<T> {
    pub fn enqueue(&self, record: T) -> Result<(), EnqueueError<T>> {
        self.run.enqueue(record)
    }

    pub fn is_closed(&self) -> bool {
        self.run.is_closed()
    }
}

impl<T> Clone for EventProducer<T> {
    fn clone(&self) -> Self {
        Self { run: Arc::clone(&self.run) }
    }
}

impl<T> std::fmt::Debug for EventProducer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventProducer").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn enqueue_before_start_is_closed() {
        let sub: DispatchSubsystem<u32> = DispatchSubsystem::new(|_: u32| {});
        assert!(sub.enqueue(1).unwrap_err().is_closed());
        assert_eq!(sub.state(), DispatchState::Stopped);
        assert!(sub.progress().is_none());
        assert!(!sub.request_shutdown(ShutdownKind::Requested));
        assert!(sub.wait().is_none());
    }

    #[test]
    fn second_start_while_running_fails() {
        let sub: DispatchSubsystem<u32> = DispatchSubsystem::new(|_: u32| {});
        let opts = DispatchOptions { max_threads: Some(1), ..Default::default() };
        sub.start(&opts).unwrap();
        assert!(matches!(sub.start(&opts), Err(StartError::AlreadyRunning)));
        assert!(sub.shutdown(ShutdownKind::Requested).is_some());
    }

    #[test]
    fn invalid_options_are_rejected() {
        let sub: DispatchSubsystem<u32> = DispatchSubsystem::new(|_: u32| {});
        let opts = DispatchOptions { max_threads: Some(0), ..Default::default() };
        assert!(matches!(sub.start(&opts), Err(StartError::InvalidOptions(_))));
        assert_eq!(sub.state(), DispatchState::Stopped);
    }

    #[test]
    fn restart_after_stop_uses_fresh_queue() {
        let sub: DispatchSubsystem<u32> = DispatchSubsystem::new(|_: u32| {});
        let opts = DispatchOptions {
            max_threads: Some(1),
            shutdown_grace: Duration::from_secs(1),
            ..Default::default()
        };
        sub.start(&opts).unwrap();
        let old = sub.producer().unwrap();
        sub.shutdown(ShutdownKind::Requested).unwrap();
        assert!(old.is_closed());

        sub.start(&opts).unwrap();
        assert_eq!(sub.progress().unwrap().submitted, 0);
        sub.enqueue(1).unwrap();
        assert!(old.enqueue(2).unwrap_err().is_closed());
        sub.shutdown(ShutdownKind::Requested).unwrap();
    }
}
