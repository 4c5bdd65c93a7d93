//! 调度循环：唯一的消费者，按 FIFO 从队列取事件并提交给工作池
//!
//! 状态机：Starting → Running → Stopping → Stopped
//! - 停机只通过 `ShutdownHandle` 设置标志并关闭队列（唤醒等待中的消费者）；
//!   清空队列、拆除工作池都在调度线程自身完成，不在信号上下文中执行。
//! - 提交顺序严格等于入队顺序；多工作线程下完成顺序不作保证。
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

use crate::error::EnqueueError;
use crate::options::{DispatchStats, WakeMode};
use crate::pool::WorkerPool;
use crate::queue::EventQueue;
use crate::types::{DispatchState, ShutdownKind};

/// 扫描例程：接收事件所有权，负责消费/释放
pub type ScanRoutine<T> = Arc<dyn Fn(T) + Send + Sync + 'static>;

/// 停机标志：0 表示未请求，其余为 `ShutdownKind` 编码
#[derive(Debug, Default)]
pub(crate) struct ShutdownFlag(AtomicU8);

impl ShutdownFlag {
    /// 仅第一次设置成功
    fn set(&self, kind: ShutdownKind) -> bool {
        self.0
            .compare_exchange(0, kind.to_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn kind(&self) -> Option<ShutdownKind> {
        ShutdownKind::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub(crate) fn is_requested(&self) -> bool {
        self.kind().is_some()
    }
}

/// 可关闭的队列（擦除事件类型，供 `ShutdownHandle` 持有）
pub(crate) trait QueueControl: Send + Sync {
    fn close_queue(&self) -> bool;
}

impl<T: Send> QueueControl for EventQueue<T> {
    fn close_queue(&self) -> bool {
        self.close()
    }
}

/// 停机触发器，可克隆、可跨线程；只设置标志并关闭队列，不做任何拆除
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<ShutdownFlag>,
    queue: Arc<dyn QueueControl>,
}

impl ShutdownHandle {
    /// 请求停机；第一次调用返回 true，之后的调用不产生任何效果并返回 false
    pub fn trigger(&self, kind: ShutdownKind) -> bool {
        if !self.flag.set(kind) {
            debug!(%kind, "shutdown already requested");
            return false;
        }
        info!(%kind, "shutdown requested");
        self.queue.close_queue();
        true
    }

    pub fn is_requested(&self) -> bool {
        self.flag.is_requested()
    }

    pub fn kind(&self) -> Option<ShutdownKind> {
        self.flag.kind()
    }
}

impl std::fmt::Debug for ShutdownHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownHandle").field("kind", &self.kind()).finish()
    }
}

/// 运行期计数（调度线程、工作线程与控制方共享）
#[derive(Debug, Default)]
pub(crate) struct ProgressCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    panicked: AtomicU64,
}

/// 运行进度快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Progress {
    pub state: DispatchState,
    /// 仍在队列中等待派发的事件数
    pub queued: usize,
    /// 调度线程已取出的事件数
    pub dequeued: u64,
    pub submitted: u64,
    pub completed: u64,
    pub panicked: u64,
}

impl Progress {
    /// 已取出但尚未完成的事件数（含刚取出、尚未提交的那一个）
    pub fn in_flight(&self) -> u64 {
        self.dequeued.saturating_sub(self.completed)
    }

    /// 队列为空且没有在途任务
    pub fn is_idle(&self) -> bool {
        self.queued == 0 && self.in_flight() == 0
    }
}

/// 一次运行的共享状态：队列、停机标志、状态机与计数
pub(crate) struct Run<T> {
    queue: Arc<EventQueue<T>>,
    flag: Arc<ShutdownFlag>,
    state: AtomicU8,
    progress: ProgressCounters,
}

impl<T: Send + 'static> Run<T> {
    pub(crate) fn new(queue: EventQueue<T>) -> Self {
        Self {
            queue: Arc::new(queue),
            flag: Arc::new(ShutdownFlag::default()),
            state: AtomicU8::new(DispatchState::Starting.to_u8()),
            progress: ProgressCounters::default(),
        }
    }

    /// 停机请求之后一律返回 Closed
    pub(crate) fn enqueue(&self, record: T) -> Result<(), EnqueueError<T>> {
        if self.flag.is_requested() {
            return Err(EnqueueError::Closed(record));
        }
        self.queue.enqueue(record)
    }

    pub(crate) fn shutdown_handle(&self) -> ShutdownHandle {
        let queue: Arc<dyn QueueControl> = self.queue.clone();
        ShutdownHandle { flag: Arc::clone(&self.flag), queue }
    }

    pub(crate) fn state(&self) -> DispatchState {
        DispatchState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: DispatchState) {
        self.state.store(state.to_u8(), Ordering::SeqCst);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.flag.is_requested() || self.queue.is_closed()
    }

    /// 先读完成数再读队列计数：任一时刻 completed <= dequeued，因此 idle 判断不会误报
    pub(crate) fn progress(&self) -> Progress {
        let completed = self.progress.completed.load(Ordering::SeqCst);
        let panicked = self.progress.panicked.load(Ordering::SeqCst);
        let submitted = self.progress.submitted.load(Ordering::SeqCst);
        let queue = self.queue.stats();
        Progress {
            state: self.state(),
            queued: queue.len,
            dequeued: queue.dequeued,
            submitted,
            completed,
            panicked,
        }
    }
}

/// 调度循环参数
#[derive(Debug, Clone, Copy)]
pub(crate) struct LoopConfig {
    pub(crate) idle_backoff: Duration,
    pub(crate) wake_mode: WakeMode,
    pub(crate) shutdown_grace: Duration,
}

/// 调度线程主体；返回本次运行的统计
pub(crate) fn run_dispatch_loop<T: Send + 'static>(
    run: Arc<Run<T>>,
    pool: Box<dyn WorkerPool>,
    routine: ScanRoutine<T>,
    cfg: LoopConfig,
) -> DispatchStats {
    let mut stats = DispatchStats::default();
    run.set_state(DispatchState::Running);
    info!(workers = pool.workers(), wake_mode = ?cfg.wake_mode, "waiting to consume events");

    while !run.flag.is_requested() {
        let next = match cfg.wake_mode {
            WakeMode::Poll => run.queue.dequeue_one(),
            WakeMode::Notify => run.queue.dequeue_timeout(cfg.idle_backoff),
        };
        match next {
            Some(record) => {
                trace!(dispatched = stats.dispatched, "consuming event");
                submit(&run, &*pool, &routine, record);
                stats.dispatched += 1;
            }
            None => {
                stats.idle_polls += 1;
                if cfg.wake_mode == WakeMode::Poll && !run.flag.is_requested() {
                    thread::sleep(cfg.idle_backoff);
                }
            }
        }
    }

    // Stopping：不再取队列；丢弃未派发事件，再拆除工作池
    run.set_state(DispatchState::Stopping);
    run.queue.close();
    let discarded = run.queue.drain();
    stats.discarded_on_shutdown = discarded.len();
    drop(discarded);
    if stats.discarded_on_shutdown > 0 {
        info!(discarded = stats.discarded_on_shutdown, "discarded undispatched events");
    }

    stats.abandoned_in_flight = pool.shutdown(cfg.shutdown_grace);
    if stats.abandoned_in_flight > 0 {
        warn!(abandoned = stats.abandoned_in_flight, "scan jobs still running after grace period");
    }

    let queue_stats = run.queue.stats();
    stats.dropped_on_overflow = queue_stats.dropped;
    stats.queue_high_water = queue_stats.high_water;
    stats.scan_panics = run.progress.panicked.load(Ordering::SeqCst);

    run.set_state(DispatchState::Stopped);
    info!(
        kind = ?run.flag.kind(),
        dispatched = stats.dispatched,
        discarded = stats.discarded_on_shutdown,
        "event queue consumer stopped"
    );
    stats
}

/// 打包 (扫描例程, 事件) 并提交；例程 panic 被捕获并计数，不影响工作线程
fn submit<T: Send + 'static>(run: &Arc<Run<T>>, pool: &dyn WorkerPool, routine: &ScanRoutine<T>, record: T) {
    let routine = Arc::clone(routine);
    let counters = Arc::clone(run);
    run.progress.submitted.fetch_add(1, Ordering::SeqCst);
    pool.submit(Box::new(move || {
        let result = panic::catch_unwind(AssertUnwindSafe(|| routine(record)));
        if result.is_err() {
            counters.progress.panicked.fetch_add(1, Ordering::SeqCst);
            error!("scan routine panicked");
        }
        counters.progress.completed.fetch_add(1, Ordering::SeqCst);
    }));
}
