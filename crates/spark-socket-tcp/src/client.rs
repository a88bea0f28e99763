use std::{net::SocketAddr, sync::Arc};

use parking_lot::Mutex;
use spark_socket_core::{
    MessageProcessor, Protocol, Session, TransportConfig, TransportError,
    error::{CONFIGURE, CONNECT},
};
use tokio::net::TcpStream;

use crate::{
    error::ServiceError,
    group::IoGroup,
    session::{SessionContext, StreamSession},
    socket::apply_stream_options,
    transport::{PlainTransportFactory, TransportFactory},
};

/// `AioClient` 建立出站 TCP 连接并为其创建 [`StreamSession`]。
///
/// 默认独占一个 [`IoGroup`]；多个客户端可通过 [`AioClient::with_group`] 共享同一组资源，
/// 此时 `shutdown` 只关闭本客户端创建的会话，组本身由其所有者停止。
pub struct AioClient<P, H>
where
    P: Protocol,
    H: MessageProcessor<P::Message>,
{
    ctx: Arc<SessionContext<P, H>>,
    factory: Arc<dyn TransportFactory>,
    owns_group: bool,
    sessions: Mutex<Vec<Arc<StreamSession<P, H>>>>,
}

impl<P, H> AioClient<P, H>
where
    P: Protocol,
    H: MessageProcessor<P::Message>,
{
    pub fn new(config: TransportConfig, protocol: P, processor: H) -> Result<Self, ServiceError> {
        let group = IoGroup::new(&config)?;
        Ok(Self::build(group, true, protocol, processor))
    }

    pub fn with_group(group: Arc<IoGroup>, protocol: P, processor: H) -> Self {
        Self::build(group, false, protocol, processor)
    }

    fn build(group: Arc<IoGroup>, owns_group: bool, protocol: P, processor: H) -> Self {
        let config = group.config();
        let ctx = SessionContext {
            protocol: Arc::new(protocol),
            processor: Arc::new(processor),
            read_buffer_size: config.read_buffer_size,
            write_queue_capacity: config.write_queue_capacity,
            group,
        };
        Self {
            ctx: Arc::new(ctx),
            factory: Arc::new(PlainTransportFactory),
            owns_group,
            sessions: Mutex::new(Vec::new()),
        }
    }

    /// 替换通道工厂，例如 TLS 客户端工厂。
    pub fn with_transport(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn group(&self) -> &Arc<IoGroup> {
        &self.ctx.group
    }

    pub fn processor(&self) -> &Arc<H> {
        &self.ctx.processor
    }

    /// 阻塞式连接；不能在 I/O 运行时线程内调用。
    pub fn connect(&self, addr: SocketAddr) -> Result<Arc<StreamSession<P, H>>, ServiceError> {
        self.ctx.group.block_on(self.connect_async(addr))?
    }

    pub async fn connect_async(
        &self,
        addr: SocketAddr,
    ) -> Result<Arc<StreamSession<P, H>>, ServiceError> {
        let group = &self.ctx.group;
        // 连接与其后的全部 I/O 注册在本组运行时的反应器上。
        let stream = group
            .handle()
            .spawn(TcpStream::connect(addr))
            .await
            .map_err(|error| TransportError::io(CONNECT, std::io::Error::other(error)))?
            .map_err(|error| TransportError::io(CONNECT, error))?;
        apply_stream_options(&stream, &group.config().socket)
            .map_err(|error| TransportError::io(CONFIGURE, error))?;
        let transport = self.factory.wrap(stream, group.arena())?;

        let session = StreamSession::open(Arc::clone(&self.ctx), transport);
        tracing::debug!(%addr, session = %session.id(), "client connected");
        let mut sessions = self.sessions.lock();
        sessions.retain(|known| !known.state().is_terminal());
        sessions.push(Arc::clone(&session));
        Ok(session)
    }

    /// 立即关闭本客户端创建的全部会话；独占的组一并停止。
    pub fn shutdown(&self) {
        let sessions = std::mem::take(&mut *self.sessions.lock());
        for session in sessions {
            session.close(true);
        }
        if self.owns_group {
            self.ctx.group.shutdown();
        }
    }
}

impl<P, H> Drop for AioClient<P, H>
where
    P: Protocol,
    H: MessageProcessor<P::Message>,
{
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<P, H> std::fmt::Debug for AioClient<P, H>
where
    P: Protocol,
    H: MessageProcessor<P::Message>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AioClient")
            .field("group", &self.ctx.group)
            .field("owns_group", &self.owns_group)
            .finish()
    }
}
