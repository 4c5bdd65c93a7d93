//! 线程安全事件队列
//!
//! 设计要点：
//! - 单把互斥锁保护全部状态（入队、出队、计数），不区分读写：出队同样要修改队列。
//! - 默认无上限，生产者永不阻塞；可选容量 + 溢出策略（见 `OverflowPolicy`）。
//! - 出队有两种：`dequeue_one` 立即返回；`dequeue_timeout` 在条件变量上等待，入队即唤醒。
//! - `close` 只标记关闭并唤醒所有等待者；之后入队一律返回 `Closed`，出队返回 None。
//!   未派发的事件由 `drain` 交还调度线程丢弃。
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::error::EnqueueError;
use crate::options::OverflowPolicy;

/// 队列计数快照
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub len: usize,
    pub enqueued: u64,
    pub dequeued: u64,
    pub dropped: u64,
    pub high_water: usize,
}

struct QueueInner<T> {
    items: VecDeque<T>,
    closed: bool,
    enqueued: u64,
    dequeued: u64,
    dropped: u64,
    high_water: usize,
}

/// FIFO 事件队列：队头最旧，队尾最新
pub struct EventQueue<T> {
    inner: Mutex<QueueInner<T>>,
    /// 有新事件或队列关闭
    not_empty: Condvar,
    /// 有空位或队列关闭（仅 Block 策略使用）
    not_full: Condvar,
    capacity: Option<usize>,
    overflow: OverflowPolicy,
}

impl<T> EventQueue<T> {
    /// 无上限队列
    pub fn unbounded() -> Self {
        Self::new(None, OverflowPolicy::DropNewest)
    }

    /// `capacity` 为 None 时不设上限，`overflow` 被忽略
    pub fn new(capacity: Option<usize>, overflow: OverflowPolicy) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                closed: false,
                enqueued: 0,
                dequeued: 0,
                dropped: 0,
                high_water: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
            overflow,
        }
    }

    /// 在队尾追加一个事件。失败时事件随错误退回，队列状态不变。
    ///
    /// `OutOfMemory` 来自 `VecDeque::try_reserve` 失败，测试中无法稳定构造；
    /// 该分支只在扩容之前返回，不修改任何计数。
    pub fn enqueue(&self, record: T) -> Result<(), EnqueueError<T>> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(EnqueueError::Closed(record));
        }

        let mut evicted = None;
        if let Some(cap) = self.capacity {
            if inner.items.len() >= cap {
                match self.overflow {
                    OverflowPolicy::DropNewest => {
                        inner.dropped += 1;
                        let dropped = inner.dropped;
                        drop(inner);
                        warn!(capacity = cap, dropped, "event queue full, dropping newest event");
                        return Err(EnqueueError::Full(record));
                    }
                    OverflowPolicy::DropOldest => {
                        evicted = inner.items.pop_front();
                        inner.dropped += 1;
                    }
                    OverflowPolicy::Block => {
                        while !inner.closed && inner.items.len() >= cap {
                            self.not_full.wait(&mut inner);
                        }
                        if inner.closed {
                            return Err(EnqueueError::Closed(record));
                        }
                    }
                }
            }
        }

        if inner.items.try_reserve(1).is_err() {
            return Err(EnqueueError::OutOfMemory(record));
        }
        inner.items.push_back(record);
        inner.enqueued += 1;
        inner.high_water = inner.high_water.max(inner.items.len());
        let dropped = inner.dropped;
        drop(inner);

        self.not_empty.notify_one();
        if evicted.is_some() {
            // 被挤出的事件在锁外释放
            drop(evicted);
            warn!(dropped, "event queue full, dropped oldest event");
        }
        Ok(())
    }

    /// 取出最旧的事件；队列为空（或已关闭）时立即返回 None，不等待
    pub fn dequeue_one(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return None;
        }
        let record = inner.items.pop_front()?;
        inner.dequeued += 1;
        drop(inner);
        self.not_full.notify_one();
        Some(record)
    }

    /// 等待至多 `timeout` 取出一个事件；入队或关闭会立即唤醒。
    /// `timeout` 超出 `Instant` 可表示范围（如 `Duration::MAX`）时视为无限等待。
    pub fn dequeue_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now().checked_add(timeout);
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return None;
            }
            if let Some(record) = inner.items.pop_front() {
                inner.dequeued += 1;
                drop(inner);
                self.not_full.notify_one();
                return Some(record);
            }
            let Some(deadline) = deadline else {
                self.not_empty.wait(&mut inner);
                continue;
            };
            if self.not_empty.wait_until(&mut inner, deadline).timed_out() {
                if inner.closed {
                    return None;
                }
                let record = inner.items.pop_front();
                if record.is_some() {
                    inner.dequeued += 1;
                    drop(inner);
                    self.not_full.notify_one();
                }
                return record;
            }
        }
    }

    /// 关闭队列并唤醒所有等待者；仅第一次调用返回 true
    pub fn close(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed {
            return false;
        }
        inner.closed = true;
        drop(inner);
        self.not_empty.notify_all();
        self.not_full.notify_all();
        true
    }

    /// 取走全部剩余事件（FIFO 顺序），队列变空
    pub fn drain(&self) -> Vec<T> {
        let mut inner = self.inner.lock();
        inner.items.drain(..).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        QueueStats {
            len: inner.items.len(),
            enqueued: inner.enqueued,
            dequeued: inner.dequeued,
            dropped: inner.dropped,
            high_water: inner.high_water,
        }
    }
}

impl<T> std::fmt::Debug for EventQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueue")
            .field("stats", &self.stats())
            .field("capacity", &self.capacity)
            .field("overflow", &self.overflow)
            .finish()
    }
}
