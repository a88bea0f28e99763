use std::{
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use spark_socket_core::{
    MessageProcessor, Protocol, SessionEvent, TransportConfig, TransportError,
    error::{ACCEPT, BIND, CONFIGURE},
};
use tokio::{net::TcpListener, sync::watch};

use crate::{
    error::ServiceError,
    group::IoGroup,
    session::{SessionContext, StreamSession},
    socket::{apply_stream_options, bind_listener},
    transport::{PlainTransportFactory, TransportFactory},
};

/// 接入失败后的退避时间，避免在 `EMFILE` 等持续性错误上空转。
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// 决定是否接纳一个新连接；拒绝的连接被立即关闭并上报 `AcceptRejected`。
pub trait AcceptFilter: Send + Sync + 'static {
    fn should_accept(&self, peer: SocketAddr) -> bool;
}

impl<F> AcceptFilter for F
where
    F: Fn(SocketAddr) -> bool + Send + Sync + 'static,
{
    fn should_accept(&self, peer: SocketAddr) -> bool {
        self(peer)
    }
}

struct Running {
    group: Arc<IoGroup>,
    local_addr: SocketAddr,
    stop: watch::Sender<bool>,
}

/// `AioServer` 监听一个 TCP 端口，为每个接入连接创建一个 [`StreamSession`]。
///
/// # 意图（Why）
/// - 把监听、接入过滤、套接字选项与会话创建串成一个后台接入循环，
///   调用方只需提供协议与处理器；
/// - 通道实现经 [`TransportFactory`] 注入，明文与 TLS 共用同一套接入逻辑。
///
/// # 逻辑（How）
/// - `start` 创建独占的 [`IoGroup`]，在其运行时上下文中以 `backlog` 绑定监听套接字，
///   然后派生接入循环；
/// - 接入循环对每个连接依次执行：过滤 → 套接字选项 → 通道包装 → 打开会话；
///   任一步失败只影响该连接。
///
/// # 契约（What）
/// - `start` 只能成功一次；`shutdown` 停止接入、关闭全部会话并停止运行时，幂等；
/// - 服务对象被丢弃时自动执行 `shutdown`。
pub struct AioServer<P, H>
where
    P: Protocol,
    H: MessageProcessor<P::Message>,
{
    config: TransportConfig,
    protocol: Arc<P>,
    processor: Arc<H>,
    filter: Option<Arc<dyn AcceptFilter>>,
    factory: Arc<dyn TransportFactory>,
    running: Mutex<Option<Running>>,
    started: bool,
}

impl<P, H> AioServer<P, H>
where
    P: Protocol,
    H: MessageProcessor<P::Message>,
{
    pub fn new(config: TransportConfig, protocol: P, processor: H) -> Self {
        Self {
            config,
            protocol: Arc::new(protocol),
            processor: Arc::new(processor),
            filter: None,
            factory: Arc::new(PlainTransportFactory),
            running: Mutex::new(None),
            started: false,
        }
    }

    pub fn with_accept_filter(mut self, filter: impl AcceptFilter) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// 替换通道工厂，例如 TLS 服务端工厂。
    pub fn with_transport(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn processor(&self) -> &Arc<H> {
        &self.processor
    }

    /// 启动监听并返回实际绑定的地址（端口为 0 时由系统分配）。
    pub fn start(&mut self) -> Result<SocketAddr, ServiceError> {
        if self.started {
            return Err(ServiceError::AlreadyStarted);
        }
        let group = IoGroup::new(&self.config)?;
        let addr = self.config.bind_addr()?;

        let listener = {
            let _guard = group.handle().enter();
            bind_listener(addr, &self.config.socket, self.config.backlog)
                .map_err(|error| TransportError::io(BIND, error))?
        };
        let local_addr = listener
            .local_addr()
            .map_err(|error| TransportError::io(BIND, error))?;

        let ctx = Arc::new(SessionContext {
            protocol: Arc::clone(&self.protocol),
            processor: Arc::clone(&self.processor),
            group: Arc::clone(&group),
            read_buffer_size: self.config.read_buffer_size,
            write_queue_capacity: self.config.write_queue_capacity,
        });
        let (stop, stopped) = watch::channel(false);
        let accept = AcceptLoop {
            listener,
            ctx,
            filter: self.filter.clone(),
            factory: Arc::clone(&self.factory),
            config: self.config.clone(),
        };
        group.handle().spawn(accept.run(stopped));

        tracing::info!(%local_addr, threads = self.config.thread_num, "server listening");
        *self.running.lock() = Some(Running {
            group,
            local_addr,
            stop,
        });
        self.started = true;
        Ok(local_addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|running| running.local_addr)
    }

    pub fn group(&self) -> Option<Arc<IoGroup>> {
        self.running
            .lock()
            .as_ref()
            .map(|running| Arc::clone(&running.group))
    }

    pub fn shutdown(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        running.stop.send_replace(true);
        running.group.shutdown();
        tracing::info!(local_addr = %running.local_addr, "server stopped");
    }
}

impl<P, H> Drop for AioServer<P, H>
where
    P: Protocol,
    H: MessageProcessor<P::Message>,
{
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct AcceptLoop<P, H> {
    listener: TcpListener,
    ctx: Arc<SessionContext<P, H>>,
    filter: Option<Arc<dyn AcceptFilter>>,
    factory: Arc<dyn TransportFactory>,
    config: TransportConfig,
}

impl<P, H> AcceptLoop<P, H>
where
    P: Protocol,
    H: MessageProcessor<P::Message>,
{
    async fn run(self, mut stopped: watch::Receiver<bool>) {
        loop {
            let accepted = tokio::select! {
                _ = stopped.changed() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(error) => {
                    tracing::warn!(%error, "accept failed");
                    let error = TransportError::io(ACCEPT, error);
                    self.ctx
                        .processor
                        .state_event(None, SessionEvent::AcceptException, Some(&error));
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
        tracing::debug!("accept loop stopped");
    }

    fn admit(&self, stream: tokio::net::TcpStream, peer: SocketAddr) {
        if let Some(filter) = &self.filter
            && !filter.should_accept(peer)
        {
            tracing::debug!(%peer, "connection rejected by accept filter");
            drop(stream);
            self.ctx
                .processor
                .state_event(None, SessionEvent::AcceptRejected, None);
            return;
        }
        if let Err(error) = apply_stream_options(&stream, &self.config.socket) {
            tracing::warn!(%peer, %error, "failed to apply socket options");
            let error = TransportError::io(CONFIGURE, error);
            self.ctx
                .processor
                .state_event(None, SessionEvent::AcceptException, Some(&error));
            return;
        }
        match self.factory.wrap(stream, self.ctx.group.arena()) {
            Ok(transport) => {
                StreamSession::open(Arc::clone(&self.ctx), transport);
            }
            Err(error) => {
                tracing::warn!(%peer, %error, "failed to wrap accepted connection");
                self.ctx
                    .processor
                    .state_event(None, SessionEvent::AcceptException, Some(&error));
            }
        }
    }
}
