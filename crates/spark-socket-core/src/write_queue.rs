use std::{collections::VecDeque, sync::Arc};

use bytes::Buf;
use parking_lot::Mutex;
use spark_socket_buffer::BufferHandle;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// 入队被拒绝时把缓冲交还调用方，由调用方决定归还或重试。
#[derive(Debug, Error)]
#[error("写队列拒绝入队（容量 {capacity}，已关闭: {closed}）")]
pub struct QueueFull {
    buffer: BufferHandle,
    capacity: usize,
    closed: bool,
}

impl QueueFull {
    pub fn into_buffer(self) -> BufferHandle {
        self.buffer
    }

    /// 队列已关闭（而非暂时满）。
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// 单写者准入许可；持有期间其他线程无法开始写出。
#[derive(Debug)]
pub struct WritePermit {
    _permit: OwnedSemaphorePermit,
}

/// 一次写完成之后的下一步。
#[derive(Debug)]
pub enum WriteStep {
    /// 继续写出该缓冲（当前缓冲的剩余部分或队列中的下一个）。
    Write(BufferHandle, WritePermit),
    /// 队列已空，许可已归还。
    Idle,
}

/// `WriteQueue` 是每个会话（UDP 为每个远端地址）独立的有界 FIFO 写队列。
///
/// # 意图（Why）
/// - 任意线程都可以写入会话，但底层通道同一时刻只能有一个在途写操作；
/// - 有界容量让生产者在消费跟不上时立即得到背压信号，而不是无限堆积内存。
///
/// # 逻辑（How）
/// - `VecDeque<BufferHandle>` 存放待写缓冲，容量在入队时检查；
/// - 准入闸门是一个只有 1 个许可的 `tokio::sync::Semaphore`，以 `try_acquire_owned`
///   非阻塞获取，许可随在途缓冲一起转移到写完成回调；
/// - [`WriteQueue::complete`] 负责“继续当前缓冲 / 拉取下一个 / 归还许可”三选一，
///   归还许可后会再次检查队列，避免并发入队与许可释放交错造成的丢失唤醒。
///
/// # 契约（What）
/// - 同一会话的字节按入队顺序写出；
/// - `enqueue` 从不阻塞；
/// - `close` 之后入队一律拒绝，已排队缓冲全部交还调用方归还竞技场。
#[derive(Debug)]
pub struct WriteQueue {
    capacity: usize,
    inner: Mutex<QueueInner>,
    gate: Arc<Semaphore>,
}

#[derive(Debug, Default)]
struct QueueInner {
    entries: VecDeque<BufferHandle>,
    closed: bool,
}

impl WriteQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(QueueInner {
                entries: VecDeque::with_capacity(capacity.min(64)),
                closed: false,
            }),
            gate: Arc::new(Semaphore::new(1)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// 当前是否还能接受入队。
    pub fn is_accepting(&self) -> bool {
        let inner = self.inner.lock();
        !inner.closed && inner.entries.len() < self.capacity
    }

    /// 队列为空且没有在途写操作。
    pub fn is_idle(&self) -> bool {
        self.gate.available_permits() == 1 && self.is_empty()
    }

    pub fn enqueue(&self, buffer: BufferHandle) -> Result<(), QueueFull> {
        let mut inner = self.inner.lock();
        if inner.closed || inner.entries.len() >= self.capacity {
            return Err(QueueFull {
                buffer,
                capacity: self.capacity,
                closed: inner.closed,
            });
        }
        inner.entries.push_back(buffer);
        Ok(())
    }

    /// 尝试成为写者：闸门空闲且队列非空时返回首个缓冲与许可。
    pub fn begin(&self) -> Option<(BufferHandle, WritePermit)> {
        loop {
            let permit = WritePermit {
                _permit: Arc::clone(&self.gate).try_acquire_owned().ok()?,
            };
            if let Some(buffer) = self.inner.lock().entries.pop_front() {
                return Some((buffer, permit));
            }
            drop(permit);
            if self.is_empty() {
                return None;
            }
        }
    }

    /// 写完成回调：`current` 为刚写出（可能部分写出）的缓冲。
    pub fn complete(&self, current: BufferHandle, permit: WritePermit) -> WriteStep {
        if current.has_remaining() && !self.inner.lock().closed {
            return WriteStep::Write(current, permit);
        }
        current.release();
        if let Some(next) = self.inner.lock().entries.pop_front() {
            return WriteStep::Write(next, permit);
        }
        drop(permit);
        match self.begin() {
            Some((buffer, permit)) => WriteStep::Write(buffer, permit),
            None => WriteStep::Idle,
        }
    }

    /// 关闭队列并取出所有待写缓冲。
    pub fn close(&self) -> Vec<BufferHandle> {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.entries.drain(..).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spark_socket_buffer::{ArenaConfig, BufferArena};

    fn filled(arena: &BufferArena, payload: &[u8]) -> BufferHandle {
        let mut handle = arena.allocate(payload.len());
        handle.put_slice(payload);
        handle
    }

    #[test]
    fn rejects_beyond_capacity_and_recovers_after_drain() {
        let arena = BufferArena::new(ArenaConfig::default());
        let queue = WriteQueue::new(2);
        queue.enqueue(filled(&arena, b"a")).expect("第一次入队");
        queue.enqueue(filled(&arena, b"b")).expect("第二次入队");
        let rejected = queue.enqueue(filled(&arena, b"c")).expect_err("第三次应被拒绝");
        assert!(!rejected.is_closed());
        rejected.into_buffer().release();

        let (mut buffer, permit) = queue.begin().expect("应成为写者");
        assert_eq!(buffer.readable(), b"a");
        buffer.advance(1);
        let step = queue.complete(buffer, permit);
        queue.enqueue(filled(&arena, b"d")).expect("腾出空间后入队");

        let WriteStep::Write(mut next, permit) = step else {
            panic!("队列非空时应继续写出");
        };
        assert_eq!(next.readable(), b"b");
        next.advance(1);
        let WriteStep::Write(mut last, permit) = queue.complete(next, permit) else {
            panic!("应拉取第四个缓冲");
        };
        assert_eq!(last.readable(), b"d");
        last.advance(1);
        assert!(matches!(queue.complete(last, permit), WriteStep::Idle));
        assert!(queue.is_idle());
        assert_eq!(arena.stats().in_use, 0);
    }

    #[test]
    fn gate_admits_a_single_writer() {
        let arena = BufferArena::new(ArenaConfig::default());
        let queue = WriteQueue::new(4);
        queue.enqueue(filled(&arena, b"x")).expect("入队");
        queue.enqueue(filled(&arena, b"y")).expect("入队");

        let (buffer, permit) = queue.begin().expect("首个写者");
        assert!(queue.begin().is_none(), "在途写期间不得出现第二个写者");
        assert!(!queue.is_idle());

        let step = queue.complete(buffer, permit);
        assert!(matches!(step, WriteStep::Write(..)), "部分写出的缓冲应继续写");
        if let WriteStep::Write(buffer, permit) = step {
            drop(permit);
            buffer.release();
        }
        for leftover in queue.close() {
            leftover.release();
        }
        assert_eq!(arena.stats().in_use, 0);
    }

    #[test]
    fn closed_queue_rejects_and_drops_partial_writes() {
        let arena = BufferArena::new(ArenaConfig::default());
        let queue = WriteQueue::new(4);
        queue.enqueue(filled(&arena, b"xyz")).expect("入队");
        let (buffer, permit) = queue.begin().expect("写者");
        assert!(queue.close().is_empty());

        assert!(matches!(queue.complete(buffer, permit), WriteStep::Idle));
        let rejected = queue.enqueue(filled(&arena, b"late")).expect_err("已关闭");
        assert!(rejected.is_closed());
        rejected.into_buffer().release();
        assert_eq!(arena.stats().in_use, 0);
    }
}
