use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use parking_lot::Mutex;
use spark_socket_core::{
    BufferArena, ReadDispatcher, Session, SessionId, TransportConfig, TransportError,
    error::RUNTIME,
};
use tokio::runtime::{Builder, Handle, Runtime};

use crate::error::ServiceError;

/// 关闭运行时时等待在途任务的上限。
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// `IoGroup` 聚合一组会话共享的执行资源：I/O 运行时、缓冲竞技场、读完成派发器与会话登记表。
///
/// # 意图（Why）
/// - 服务端与客户端都需要同一套资源；把它们收拢到一个对象中，
///   可以让多个服务端/客户端显式共享（`Arc<IoGroup>`），也便于统一关闭；
/// - 竞技场是全部会话唯一共享的资源，测试通过 [`IoGroup::arena`] 的统计检查泄漏。
///
/// # 逻辑（How）
/// - 运行时为 Tokio 多线程运行时，工作线程数等于 `thread_num`，线程名 `spark-socket:io-<n>`；
/// - 派发器嵌套许可数为 `thread_num - 1`，事件环容量取 `ring_capacity`；
/// - 会话在创建时登记、关闭时注销，[`IoGroup::shutdown`] 先立即关闭全部会话再停止运行时。
///
/// # 契约（What）
/// - `shutdown` 幂等；不得在本组的 I/O 线程上调用阻塞式 API（`block_on`）。
pub struct IoGroup {
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    arena: BufferArena,
    dispatcher: Option<ReadDispatcher>,
    sessions: DashMap<SessionId, Arc<dyn Session>>,
    config: TransportConfig,
}

impl IoGroup {
    pub fn new(config: &TransportConfig) -> Result<Arc<Self>, ServiceError> {
        Self::build(config, true)
    }

    /// 不带读完成派发器的资源组，供数据报复用器使用：其读路径由单个接收任务驱动，
    /// 不会发生读完成递归，因此不启动 `spark-socket:ring` 消费线程。
    pub fn datagram(config: &TransportConfig) -> Result<Arc<Self>, ServiceError> {
        Self::build(config, false)
    }

    fn build(config: &TransportConfig, with_dispatcher: bool) -> Result<Arc<Self>, ServiceError> {
        config.validate()?;

        let counter = AtomicUsize::new(0);
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.thread_num)
            .thread_name_fn(move || {
                format!("spark-socket:io-{}", counter.fetch_add(1, Ordering::Relaxed))
            })
            .enable_io()
            .enable_time()
            .build()
            .map_err(|error| TransportError::io(RUNTIME, error))?;
        let dispatcher = if with_dispatcher {
            let dispatcher = ReadDispatcher::start(
                config.thread_num - 1,
                config.ring_capacity,
                config.ring_publish_timeout(),
            )
            .map_err(|error| TransportError::io(RUNTIME, error))?;
            Some(dispatcher)
        } else {
            None
        };

        tracing::debug!(
            threads = config.thread_num,
            ring_capacity = config.ring_capacity,
            dispatcher = with_dispatcher,
            "io group started"
        );
        Ok(Arc::new(Self {
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
            arena: BufferArena::new(config.arena_config()),
            dispatcher,
            sessions: DashMap::new(),
            config: config.clone(),
        }))
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn arena(&self) -> &BufferArena {
        &self.arena
    }

    /// 读完成派发器；[`IoGroup::datagram`] 创建的资源组没有派发器。
    pub fn dispatcher(&self) -> Option<&ReadDispatcher> {
        self.dispatcher.as_ref()
    }

    /// 经派发器执行一次读完成回调；没有派发器时在当前线程执行。
    pub(crate) fn dispatch<F>(&self, completion: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match &self.dispatcher {
            Some(dispatcher) => dispatcher.dispatch(completion),
            None => completion(),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// 当前登记的存活会话数。
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub(crate) fn register(&self, session: Arc<dyn Session>) {
        self.sessions.insert(session.id(), session);
    }

    pub(crate) fn unregister(&self, id: SessionId) {
        self.sessions.remove(&id);
    }

    /// 立即关闭全部存活会话。
    pub fn close_sessions(&self) {
        let sessions: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for session in sessions {
            session.close(true);
        }
    }

    /// 在 I/O 运行时上阻塞执行 `future`。
    pub fn block_on<F: Future>(&self, future: F) -> Result<F::Output, ServiceError> {
        if Handle::try_current().is_ok() {
            return Err(ServiceError::BlockingInRuntime);
        }
        Ok(self.handle.block_on(future))
    }

    pub fn shutdown(&self) {
        self.close_sessions();
        let runtime = self.runtime.lock().take();
        if let Some(runtime) = runtime {
            if Handle::try_current().is_ok() {
                runtime.shutdown_background();
            } else {
                runtime.shutdown_timeout(SHUTDOWN_GRACE);
            }
            tracing::debug!(stats = ?self.arena.stats(), "io group stopped");
        }
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.shutdown();
        }
    }
}

impl Drop for IoGroup {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for IoGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoGroup")
            .field("sessions", &self.sessions.len())
            .field("arena", &self.arena)
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}
