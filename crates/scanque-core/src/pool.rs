//! 工作池：调度线程只负责提交，扫描在池内线程执行
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// 一个待执行的扫描任务（扫描例程 + 事件，已打包为闭包）
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// 固定大小的工作池
///
/// 约定：`submit` 不等待任务完成；`shutdown` 最多等待 `grace`，
/// 返回仍未完成（被放弃）的任务数。
pub trait WorkerPool: Send {
    fn submit(&self, job: Job);
    fn workers(&self) -> usize;
    fn shutdown(self: Box<Self>, grace: Duration) -> usize;
}

/// 在途任务计数
#[derive(Default)]
struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl InFlight {
    fn begin(&self) {
        *self.count.lock() += 1;
    }

    fn end(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    fn current(&self) -> usize {
        *self.count.lock()
    }

    /// 等到计数归零或超时，返回剩余数；`grace` 过大（如 `Duration::MAX`）时一直等到归零
    fn wait_idle(&self, grace: Duration) -> usize {
        let deadline = Instant::now().checked_add(grace);
        let mut count = self.count.lock();
        while *count > 0 {
            match deadline {
                Some(deadline) => {
                    if self.idle.wait_until(&mut count, deadline).timed_out() {
                        break;
                    }
                }
                None => self.idle.wait(&mut count),
            }
        }
        *count
    }
}

/// 任务结束（包括 panic 展开）时递减在途计数
struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.end();
    }
}

/// 基于 Rayon 线程池的实现；提交顺序即池内取任务顺序（FIFO）
pub struct RayonPool {
    pool: rayon::ThreadPool,
    in_flight: Arc<InFlight>,
    workers: usize,
}

impl RayonPool {
    pub fn new(workers: usize) -> Result<Self, rayon::ThreadPoolBuildError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("scan-worker-{i}"))
            .panic_handler(|_| error!("scan worker job panicked"))
            .build()?;
        Ok(Self { pool, in_flight: Arc::new(InFlight::default()), workers })
    }

    /// 已提交但尚未结束的任务数
    pub fn in_flight(&self) -> usize {
        self.in_flight.current()
    }
}

impl WorkerPool for RayonPool {
    fn submit(&self, job: Job) {
        self.in_flight.begin();
        let guard = InFlightGuard(Arc::clone(&self.in_flight));
        self.pool.spawn_fifo(move || {
            let _guard = guard;
            job();
        });
    }

    fn workers(&self) -> usize {
        self.workers
    }

    fn shutdown(self: Box<Self>, grace: Duration) -> usize {
        let this = *self;
        let abandoned = this.in_flight.wait_idle(grace);
        debug!(workers = this.workers, abandoned, "tearing down worker pool");
        // 线程池在 drop 时通知工作线程退出，不阻塞当前线程
        drop(this.pool);
        abandoned
    }
}

impl std::fmt::Debug for RayonPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RayonPool")
            .field("workers", &self.workers)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn single_worker_runs_jobs_in_submit_order() {
        let pool = RayonPool::new(1).unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        for i in 0..20 {
            let tx = tx.clone();
            pool.submit(Box::new(move || tx.send(i).unwrap()));
        }
        let got: Vec<i32> = (0..20).map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap()).collect();
        assert_eq!(got, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn shutdown_waits_for_in_flight_jobs() {
        let pool = Box::new(RayonPool::new(2).unwrap());
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let done = Arc::clone(&done);
            pool.submit(Box::new(move || {
                std::thread::sleep(Duration::from_millis(20));
                done.fetch_add(1, Ordering::SeqCst);
            }));
        }
        let abandoned = pool.shutdown(Duration::from_secs(5));
        assert_eq!(abandoned, 0);
        assert_eq!(done.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn unbounded_grace_waits_for_completion() {
        let pool = Box::new(RayonPool::new(1).unwrap());
        let done = Arc::new(AtomicUsize::new(0));
        {
            let done = Arc::clone(&done);
            pool.submit(Box::new(move || {
                std::thread::sleep(Duration::from_millis(20));
                done.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert_eq!(pool.shutdown(Duration::MAX), 0);
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn shutdown_abandons_jobs_past_grace() {
        let pool = Box::new(RayonPool::new(1).unwrap());
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
        pool.submit(Box::new(move || {
            let _ = release_rx.recv_timeout(Duration::from_secs(5));
        }));
        let abandoned = pool.shutdown(Duration::from_millis(20));
        assert_eq!(abandoned, 1);
        drop(release_tx);
    }

    #[test]
    fn panicking_job_still_leaves_pool_idle() {
        let pool = RayonPool::new(1).unwrap();
        pool.submit(Box::new(|| panic!("boom")));
        let (tx, rx) = crossbeam_channel::bounded(1);
        pool.submit(Box::new(move || tx.send(()).unwrap()));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(Box::new(pool).shutdown(Duration::from_secs(5)), 0);
    }
}
