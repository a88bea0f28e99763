use std::sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

use bytes::BytesMut;
use parking_lot::Mutex;

use crate::handle::{BufferHandle, Origin};

/// 最小尺寸类为 64 字节（2^6）。
const MIN_CLASS_SHIFT: u32 = 6;

/// 竞技场的构造参数。
///
/// # 契约说明（What）
/// - `page_size`：单页字节数，超过单页的请求直接走独立分配；
/// - `page_count`：预分配页数，为 0 时竞技场退化为纯独立分配（仍然计数）。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArenaConfig {
    pub page_size: usize,
    pub page_count: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            page_size: 256 * 1024,
            page_count: 4,
        }
    }
}

/// 竞技场统计快照。
///
/// - `allocations`：累计分配次数（池化 + 独立）；
/// - `releases`：显式 `release` 次数；
/// - `implicit_releases`：句柄未经 `release` 直接 `Drop` 的次数，理想情况下恒为 0；
/// - `overflow_allocations`：页耗尽后降级为独立分配的次数；
/// - `in_use`：尚未归还的句柄数。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ArenaStats {
    pub allocations: u64,
    pub releases: u64,
    pub implicit_releases: u64,
    pub pooled_allocations: u64,
    pub overflow_allocations: u64,
    pub in_use: u64,
    pub page_count: usize,
    pub page_size: usize,
}

/// `BufferArena` 是会话共享的唯一资源：固定数量的预分配页 + 尺寸类自由链表。
///
/// # 模块角色（Why）
/// - 读缓冲与写缓冲的生命周期与会话强绑定，复用固定容量的块可以避免高频分配；
/// - 页耗尽时不阻塞、不失败，而是降级为独立分配并记录 `overflow_allocations`，
///   让容量规划问题以统计形式暴露，而不是以连接失败的形式暴露。
///
/// # 核心机制（How）
/// - 请求尺寸向上取整到二次幂尺寸类（最小 64 字节）；
/// - 通过原子游标轮询选择起始页，依次尝试每页：先复用同尺寸类的自由块，
///   再从页内未切分区域 `split_to` 出新块；
/// - 每页一把 `parking_lot::Mutex`，并发分配分散在不同页上。
///
/// # 契约说明（What）
/// - `allocate` 返回的句柄 `capacity()` 恰为请求尺寸，可读区为空；
/// - 每个句柄必须恰好归还一次：`release` 消耗句柄，遗漏时由 `Drop` 兜底并计入
///   `implicit_releases`。
///
/// # 设计权衡（Trade-offs）
/// - 尺寸类之间不做合并，页内碎片以独立分配兜底；会话读写缓冲尺寸集中，实践中命中率很高。
#[derive(Clone)]
pub struct BufferArena {
    shared: Arc<ArenaShared>,
}

impl BufferArena {
    /// 按配置预分配全部页。
    pub fn new(config: ArenaConfig) -> Self {
        let pages = (0..config.page_count)
            .map(|_| Page::new(config.page_size))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            shared: Arc::new(ArenaShared {
                pages,
                cursor: AtomicUsize::new(0),
                config,
                metrics: ArenaMetrics::default(),
            }),
        }
    }

    /// 分配一个容量恰为 `size` 的句柄；永不失败。
    pub fn allocate(&self, size: usize) -> BufferHandle {
        self.shared.allocate(size)
    }

    /// 归还句柄，等价于 [`BufferHandle::release`]。
    pub fn release(&self, handle: BufferHandle) {
        handle.release();
    }

    pub fn config(&self) -> ArenaConfig {
        self.shared.config
    }

    /// 读取统计快照。
    pub fn stats(&self) -> ArenaStats {
        self.shared.snapshot()
    }
}

impl std::fmt::Debug for BufferArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferArena")
            .field("config", &self.shared.config)
            .field("stats", &self.shared.snapshot())
            .finish()
    }
}

pub(crate) struct ArenaShared {
    pages: Box<[Page]>,
    cursor: AtomicUsize,
    config: ArenaConfig,
    metrics: ArenaMetrics,
}

impl ArenaShared {
    pub(crate) fn allocate(self: &Arc<Self>, size: usize) -> BufferHandle {
        self.metrics.allocations.fetch_add(1, Ordering::Relaxed);

        let (class, class_size) = size_class(size);
        if class_size <= self.config.page_size && !self.pages.is_empty() {
            let start = self.cursor.fetch_add(1, Ordering::Relaxed);
            for offset in 0..self.pages.len() {
                let index = (start + offset) % self.pages.len();
                if let Some(chunk) = self.pages[index].take(class, class_size) {
                    self.metrics
                        .pooled_allocations
                        .fetch_add(1, Ordering::Relaxed);
                    return BufferHandle::new(
                        chunk,
                        Origin::Pooled { page: index, class },
                        size,
                        Arc::clone(self),
                    );
                }
            }
        }

        self.metrics
            .overflow_allocations
            .fetch_add(1, Ordering::Relaxed);
        tracing::trace!(size, "arena pages exhausted, falling back to standalone allocation");
        BufferHandle::new(
            BytesMut::zeroed(size),
            Origin::Standalone,
            size,
            Arc::clone(self),
        )
    }

    /// 回收入口：由句柄在 `release` 或 `Drop` 时调用一次。
    pub(crate) fn reclaim(&self, chunk: BytesMut, origin: Origin, explicit: bool) {
        if explicit {
            self.metrics.releases.fetch_add(1, Ordering::Relaxed);
        } else {
            self.metrics
                .implicit_releases
                .fetch_add(1, Ordering::Relaxed);
        }
        if let Origin::Pooled { page, class } = origin
            && let Some(page) = self.pages.get(page)
        {
            page.give_back(class, chunk);
        }
    }

    fn snapshot(&self) -> ArenaStats {
        let allocations = self.metrics.allocations.load(Ordering::Relaxed);
        let releases = self.metrics.releases.load(Ordering::Relaxed);
        let implicit_releases = self.metrics.implicit_releases.load(Ordering::Relaxed);
        ArenaStats {
            allocations,
            releases,
            implicit_releases,
            pooled_allocations: self.metrics.pooled_allocations.load(Ordering::Relaxed),
            overflow_allocations: self.metrics.overflow_allocations.load(Ordering::Relaxed),
            in_use: allocations.saturating_sub(releases + implicit_releases),
            page_count: self.config.page_count,
            page_size: self.config.page_size,
        }
    }
}

#[derive(Default)]
struct ArenaMetrics {
    allocations: AtomicU64,
    releases: AtomicU64,
    implicit_releases: AtomicU64,
    pooled_allocations: AtomicU64,
    overflow_allocations: AtomicU64,
}

struct Page {
    state: Mutex<PageState>,
}

struct PageState {
    untouched: BytesMut,
    free: Vec<Vec<BytesMut>>,
}

impl Page {
    fn new(page_size: usize) -> Self {
        Self {
            state: Mutex::new(PageState {
                untouched: BytesMut::zeroed(page_size),
                free: Vec::new(),
            }),
        }
    }

    fn take(&self, class: usize, class_size: usize) -> Option<BytesMut> {
        let mut state = self.state.lock();
        if let Some(chunk) = state.free.get_mut(class).and_then(Vec::pop) {
            return Some(chunk);
        }
        if state.untouched.len() >= class_size {
            return Some(state.untouched.split_to(class_size));
        }
        None
    }

    fn give_back(&self, class: usize, chunk: BytesMut) {
        let mut state = self.state.lock();
        if state.free.len() <= class {
            state.free.resize_with(class + 1, Vec::new);
        }
        state.free[class].push(chunk);
    }
}

/// 计算尺寸类下标与尺寸类字节数。
fn size_class(size: usize) -> (usize, usize) {
    let class_size = size.max(1 << MIN_CLASS_SHIFT).next_power_of_two();
    let class = (class_size.trailing_zeros() - MIN_CLASS_SHIFT) as usize;
    (class, class_size)
}
