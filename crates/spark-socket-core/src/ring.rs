use std::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, Instant},
};

use crossbeam_queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};

/// `EventRing` 是固定容量的多生产者事件环。
///
/// # 意图（Why）
/// - 读完成回调在完成线程上嵌套执行时深度无界，需要一个把事件转交给专用消费者的出口；
/// - 槽位在构造时一次性分配（`crossbeam_queue::ArrayQueue`），稳态下不产生分配。
///
/// # 逻辑（How）
/// - 入队、出队走无锁的 `ArrayQueue`；
/// - 仅在“满”或“空”时才借助 `parking_lot::Condvar` 睡眠，唤醒方在通知前获取同一把锁，
///   与等待方的“检查 → 睡眠”形成互斥，不会丢失唤醒。
///
/// # 契约（What）
/// - FIFO；容量固定；
/// - `publish_timeout` 在环满时最多等待 `wait`，超时把事件原样退回调用方；
/// - `close` 之后发布立即失败，消费者取尽剩余事件后得到 `None`。
pub struct EventRing<T> {
    slots: ArrayQueue<T>,
    lock: Mutex<()>,
    not_empty: Condvar,
    not_full: Condvar,
    closed: AtomicBool,
}

impl<T> EventRing<T> {
    /// # Panics
    /// `capacity` 为 0 时 panic（`ArrayQueue` 的约束）。
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: ArrayQueue::new(capacity),
            lock: Mutex::new(()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 非阻塞发布。
    pub fn try_publish(&self, item: T) -> Result<(), T> {
        if self.is_closed() {
            return Err(item);
        }
        self.slots.push(item)?;
        let _guard = self.lock.lock();
        self.not_empty.notify_one();
        Ok(())
    }

    /// 环满时最多等待 `wait`。
    pub fn publish_timeout(&self, item: T, wait: Duration) -> Result<(), T> {
        let deadline = Instant::now() + wait;
        let mut item = match self.try_publish(item) {
            Ok(()) => return Ok(()),
            Err(item) => item,
        };
        let mut guard = self.lock.lock();
        loop {
            if self.is_closed() {
                return Err(item);
            }
            match self.slots.push(item) {
                Ok(()) => {
                    self.not_empty.notify_one();
                    return Ok(());
                }
                Err(rejected) => item = rejected,
            }
            if self.not_full.wait_until(&mut guard, deadline).timed_out() {
                return self.slots.push(item).inspect(|_| {
                    self.not_empty.notify_one();
                });
            }
        }
    }

    pub fn try_take(&self) -> Option<T> {
        let item = self.slots.pop()?;
        let _guard = self.lock.lock();
        self.not_full.notify_one();
        Some(item)
    }

    /// 等待至多 `wait` 取出一个事件；环已关闭且为空时立即返回 `None`。
    pub fn take_timeout(&self, wait: Duration) -> Option<T> {
        let deadline = Instant::now() + wait;
        let mut guard = self.lock.lock();
        loop {
            if let Some(item) = self.slots.pop() {
                self.not_full.notify_one();
                return Some(item);
            }
            if self.is_closed() {
                return None;
            }
            if self.not_empty.wait_until(&mut guard, deadline).timed_out() {
                let item = self.slots.pop();
                if item.is_some() {
                    self.not_full.notify_one();
                }
                return item;
            }
        }
    }

    /// 关闭事件环并唤醒全部等待者。
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _guard = self.lock.lock();
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

impl<T> fmt::Debug for EventRing<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRing")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
