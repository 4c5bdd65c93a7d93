//! 按需扫描事件调度库
//!
//! 设计要点：
//! - 生产者（文件访问监控）只调用入队，默认无上限，永不阻塞。
//! - 单个调度线程按 FIFO 取事件，提交给固定大小工作池执行扫描例程，不等待完成。
//! - 停机由标志驱动：触发方只设置标志并关闭队列，清理与拆除在调度线程上完成。
//! - 无全局状态：每个 `DispatchSubsystem` 独立拥有自己的队列与工作池。

mod options;
mod types;
mod error;
mod queue;
mod pool;
mod dispatch;
mod lifecycle;
mod config;

pub use options::{DispatchOptions, DispatchStats, OverflowPolicy, WakeMode};
pub use types::{DispatchState, EventSource, ScanEvent, ShutdownKind};
pub use error::{EnqueueError, StartError};
pub use queue::{EventQueue, QueueStats};
pub use pool::{Job, RayonPool, WorkerPool};
pub use dispatch::{Progress, ScanRoutine, ShutdownHandle};
pub use lifecycle::{DispatchSubsystem, EventProducer};
pub use config::{load_options, parse_options};
