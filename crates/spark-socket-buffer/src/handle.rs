use std::{fmt, mem, sync::Arc};

use bytes::{Buf, BytesMut};

use crate::arena::ArenaShared;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Origin {
    Pooled { page: usize, class: usize },
    Standalone,
}

/// `BufferHandle` 表示从 [`BufferArena`](crate::BufferArena) 租借的一块固定容量字节区。
///
/// # 设计初衷（Why）
/// - 会话读路径需要“追加写入 → 解码消费 → 压缩残余”的循环，
///   写路径需要“整块写出、可部分完成”的语义，两者都依赖显式的读写游标；
/// - 句柄以值语义在组件间转移（读缓冲、写队列、在途写槽位、TLS 暂存区），
///   任一时刻只有一个持有者。
///
/// # 游标模型（How）
/// - `0..position`：已消费；`position..limit`：可读区；`limit..capacity`：空闲区；
/// - `commit(n)` 将空闲区前 `n` 字节纳入可读区，`advance(n)` 消费可读区；
/// - `compact()` 把可读区搬移到头部，`clear()` 复位两个游标。
///
/// # 契约说明（What）
/// - `release(self)` 恰好归还一次；遗漏时 `Drop` 会兜底归还并记录告警；
/// - 实现 [`bytes::Buf`]，协议解码器可直接使用 `get_u32`、`copy_to_bytes` 等方法；
/// - 不实现 `Clone`：复制句柄会破坏“恰好归还一次”的不变式。
pub struct BufferHandle {
    chunk: BytesMut,
    origin: Origin,
    capacity: usize,
    position: usize,
    limit: usize,
    returned: bool,
    arena: Arc<ArenaShared>,
}

impl BufferHandle {
    pub(crate) fn new(
        chunk: BytesMut,
        origin: Origin,
        capacity: usize,
        arena: Arc<ArenaShared>,
    ) -> Self {
        debug_assert!(chunk.len() >= capacity);
        Self {
            chunk,
            origin,
            capacity,
            position: 0,
            limit: 0,
            returned: false,
            arena,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 空闲区字节数。
    pub fn spare(&self) -> usize {
        self.capacity - self.limit
    }

    /// 空闲区为 0 且可读区从头部开始时视为“满”：压缩也腾不出空间。
    pub fn is_full(&self) -> bool {
        self.position == 0 && self.limit == self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.position == self.limit
    }

    /// 是否来自预分配页（否则为降级的独立分配）。
    pub fn is_pooled(&self) -> bool {
        matches!(self.origin, Origin::Pooled { .. })
    }

    pub fn readable(&self) -> &[u8] {
        &self.chunk[self.position..self.limit]
    }

    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.chunk[self.limit..self.capacity]
    }

    /// 将空闲区前 `n` 字节标记为可读，通常在一次读取写入 `spare_mut()` 之后调用。
    ///
    /// # Panics
    /// `n` 超过空闲区大小时 panic。
    pub fn commit(&mut self, n: usize) {
        assert!(n <= self.spare(), "commit {n} exceeds spare {}", self.spare());
        self.limit += n;
    }

    /// 尽可能多地追加 `src`，返回实际写入的字节数。
    pub fn put_slice(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.spare());
        self.chunk[self.limit..self.limit + n].copy_from_slice(&src[..n]);
        self.limit += n;
        n
    }

    /// 将可读区搬移到头部，腾出尾部空闲区。
    pub fn compact(&mut self) {
        if self.position == 0 {
            return;
        }
        if self.position == self.limit {
            self.clear();
            return;
        }
        self.chunk.copy_within(self.position..self.limit, 0);
        self.limit -= self.position;
        self.position = 0;
    }

    pub fn clear(&mut self) {
        self.position = 0;
        self.limit = 0;
    }

    /// 扩容到 `new_capacity`，保留可读区内容；旧块归还竞技场。
    ///
    /// `new_capacity` 不大于当前容量时不做任何事。
    pub fn grow(&mut self, new_capacity: usize) {
        if new_capacity <= self.capacity {
            return;
        }
        let mut next = self.arena.allocate(new_capacity);
        next.put_slice(self.readable());
        let previous = mem::replace(self, next);
        previous.release();
    }

    /// 归还句柄。
    pub fn release(mut self) {
        self.give_back(true);
    }

    fn give_back(&mut self, explicit: bool) {
        if self.returned {
            return;
        }
        self.returned = true;
        let chunk = mem::take(&mut self.chunk);
        self.arena.reclaim(chunk, self.origin, explicit);
    }
}

impl Buf for BufferHandle {
    fn remaining(&self) -> usize {
        self.limit - self.position
    }

    fn chunk(&self) -> &[u8] {
        self.readable()
    }

    fn advance(&mut self, cnt: usize) {
        assert!(
            cnt <= self.limit - self.position,
            "advance {cnt} exceeds readable {}",
            self.limit - self.position
        );
        self.position += cnt;
    }
}

impl Drop for BufferHandle {
    fn drop(&mut self) {
        if !self.returned {
            tracing::warn!(
                capacity = self.capacity,
                pooled = self.is_pooled(),
                "buffer handle dropped without release, reclaiming implicitly"
            );
            self.give_back(false);
        }
    }
}

impl fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferHandle")
            .field("capacity", &self.capacity)
            .field("position", &self.position)
            .field("limit", &self.limit)
            .field("origin", &self.origin)
            .finish()
    }
}
