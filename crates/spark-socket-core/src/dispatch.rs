use std::{
    cell::Cell,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::ring::EventRing;

type Task = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    /// 当前线程是否正处于一次读完成回调之内。
    static IN_COMPLETION: Cell<bool> = const { Cell::new(false) };
}

/// 进入回调时置位、离开（含 panic 展开）时复位。
struct CompletionMark {
    previous: bool,
}

impl CompletionMark {
    fn enter() -> Self {
        Self {
            previous: IN_COMPLETION.replace(true),
        }
    }
}

impl Drop for CompletionMark {
    fn drop(&mut self) {
        IN_COMPLETION.set(self.previous);
    }
}

/// 派发计数快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// 线程首次进入回调，直接执行。
    pub inline: u64,
    /// 已在回调内，拿到许可后嵌套执行。
    pub nested: u64,
    /// 许可耗尽，转交事件环。
    pub deferred: u64,
    /// 事件环持续满载超过发布等待时间，退回当前线程执行。
    pub overflow_inline: u64,
}

#[derive(Default)]
struct DispatchCounters {
    inline: AtomicU64,
    nested: AtomicU64,
    deferred: AtomicU64,
    overflow_inline: AtomicU64,
}

/// `ReadDispatcher` 决定一次读完成回调在哪里执行。
///
/// # 意图（Why）
/// - 读完成后会话会立刻重新发起读取；若数据已就绪，下一次完成会在同一线程上
///   “立即完成”，形成无界递归；
/// - 需要在不丢事件的前提下把递归深度限制在常数以内。
///
/// # 逻辑（How）
/// 1. 线程本地标记为假：置位后直接执行（最常见路径）；
/// 2. 标记为真：尝试从容量为 `thread_num - 1` 的信号量取许可，成功则嵌套执行；
/// 3. 许可耗尽：发布到固定容量的 [`EventRing`]，由专用线程 `spark-socket:ring` 消费；
/// 4. 事件环满且等待超时：在当前线程执行，保证事件不被丢弃。
///
/// # 契约（What）
/// - 同一线程上的嵌套深度不超过许可数 + 1；
/// - 回调中的 panic 不会杀死消费线程，也不会泄漏线程本地标记；
/// - [`ReadDispatcher::shutdown`] 关闭事件环，消费线程执行完剩余事件后退出。
pub struct ReadDispatcher {
    permits: Semaphore,
    ring: Arc<EventRing<Task>>,
    publish_timeout: Duration,
    counters: Arc<DispatchCounters>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl ReadDispatcher {
    /// 启动消费线程。`nested_permits` 通常为 `thread_num - 1`。
    pub fn start(
        nested_permits: usize,
        ring_capacity: usize,
        publish_timeout: Duration,
    ) -> std::io::Result<Self> {
        let ring: Arc<EventRing<Task>> = Arc::new(EventRing::new(ring_capacity.max(1)));
        let counters = Arc::new(DispatchCounters::default());
        let consumer = {
            let ring = Arc::clone(&ring);
            thread::Builder::new()
                .name("spark-socket:ring".to_owned())
                .spawn(move || drain(&ring))?
        };
        Ok(Self {
            permits: Semaphore::new(nested_permits),
            ring,
            publish_timeout,
            counters,
            consumer: Mutex::new(Some(consumer)),
        })
    }

    pub fn dispatch<F>(&self, completion: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if !IN_COMPLETION.get() {
            self.counters.inline.fetch_add(1, Ordering::Relaxed);
            let _mark = CompletionMark::enter();
            completion();
            return;
        }

        if let Ok(_permit) = self.permits.try_acquire() {
            self.counters.nested.fetch_add(1, Ordering::Relaxed);
            completion();
            return;
        }

        match self
            .ring
            .publish_timeout(Box::new(completion), self.publish_timeout)
        {
            Ok(()) => {
                self.counters.deferred.fetch_add(1, Ordering::Relaxed);
            }
            Err(completion) => {
                self.counters.overflow_inline.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    capacity = self.ring.capacity(),
                    "event ring saturated, running read completion inline"
                );
                completion();
            }
        }
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            inline: self.counters.inline.load(Ordering::Relaxed),
            nested: self.counters.nested.load(Ordering::Relaxed),
            deferred: self.counters.deferred.load(Ordering::Relaxed),
            overflow_inline: self.counters.overflow_inline.load(Ordering::Relaxed),
        }
    }

    /// 当前线程是否处于读完成回调内。
    pub fn in_completion() -> bool {
        IN_COMPLETION.get()
    }

    /// 关闭事件环并等待消费线程退出；重复调用无副作用。
    pub fn shutdown(&self) {
        self.ring.close();
        let handle = self.consumer.lock().take();
        if let Some(handle) = handle
            && handle.thread().id() != thread::current().id()
            && handle.join().is_err()
        {
            tracing::error!("event ring consumer terminated by panic");
        }
    }
}

impl Drop for ReadDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ReadDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadDispatcher")
            .field("available_permits", &self.permits.available_permits())
            .field("ring", &self.ring)
            .field("stats", &self.stats())
            .finish()
    }
}

fn drain(ring: &EventRing<Task>) {
    loop {
        match ring.take_timeout(Duration::from_millis(200)) {
            Some(task) => {
                let _mark = CompletionMark::enter();
                if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                    tracing::error!("deferred read completion panicked");
                }
            }
            None if ring.is_closed() => break,
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
        mpsc,
    };

    fn recurse(dispatcher: Arc<ReadDispatcher>, remaining: usize, done: mpsc::Sender<usize>) {
        if remaining == 0 {
            done.send(0).expect("发送完成信号");
            return;
        }
        let next = Arc::clone(&dispatcher);
        dispatcher.dispatch(move || recurse(next, remaining - 1, done));
    }

    #[test]
    fn deep_recursion_is_bounded_by_permits() {
        let dispatcher = Arc::new(
            ReadDispatcher::start(2, 64, Duration::from_millis(50)).expect("启动派发器"),
        );
        let (tx, rx) = mpsc::channel();
        recurse(Arc::clone(&dispatcher), 500, tx);
        rx.recv_timeout(Duration::from_secs(5)).expect("递归链应完成");

        let stats = dispatcher.stats();
        assert!(stats.deferred > 0, "超过许可后必须转交事件环: {stats:?}");
        assert_eq!(
            stats.inline + stats.nested + stats.deferred + stats.overflow_inline,
            500
        );
        dispatcher.shutdown();
    }

    #[test]
    fn outside_completion_runs_inline() {
        let dispatcher = ReadDispatcher::start(1, 4, Duration::from_millis(10)).expect("启动");
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let hits = Arc::clone(&hits);
            dispatcher.dispatch(move || {
                assert!(ReadDispatcher::in_completion());
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert!(!ReadDispatcher::in_completion());
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(dispatcher.stats().inline, 3);
    }

    #[test]
    fn panics_do_not_leak_the_completion_mark() {
        let dispatcher = ReadDispatcher::start(1, 4, Duration::from_millis(10)).expect("启动");
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            dispatcher.dispatch(|| panic!("boom"));
        }));
        assert!(outcome.is_err());
        assert!(!ReadDispatcher::in_completion());
    }
}
