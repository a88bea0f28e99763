use std::{
    collections::{HashSet, VecDeque},
    fmt, io,
    hash::{BuildHasher, RandomState},
    net::SocketAddr,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use bytes::Buf;
use dashmap::DashMap;
use parking_lot::Mutex;
use socket2::{Domain, Socket, Type};
use spark_socket_core::{
    BufferHandle, EventRing, MessageProcessor, Protocol, Session, SessionEvent, SessionId,
    SocketOptions, TransportConfig, TransportError, WritePermit, WriteStep,
    error::{BIND, RUNTIME, SEND_TO},
};
use spark_socket_tcp::{IoGroup, ServiceError};
use tokio::{
    net::UdpSocket,
    sync::{Notify, watch},
};

use crate::{
    session::UdpSession,
    worker::{self, Delivery},
};

/// 关闭时等待接收任务退出的上限。
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// 复用器内部状态，由接收任务、分片线程与逻辑会话共享。
pub(crate) struct UdpCore<P, H>
where
    P: Protocol,
    H: MessageProcessor<P::Message>,
{
    pub(crate) socket: UdpSocket,
    pub(crate) protocol: Arc<P>,
    pub(crate) processor: Arc<H>,
    pub(crate) group: Arc<IoGroup>,
    sessions: DashMap<SocketAddr, Arc<UdpSession<P, H>>>,
    dirty: Mutex<HashSet<SocketAddr>>,
    wake: Notify,
    shards: Vec<Arc<EventRing<Delivery<P, H>>>>,
    hasher: RandomState,
    publish_timeout: Duration,
    write_queue_capacity: usize,
    me: Weak<Self>,
}

/// 套接字写满时挂起的在途数据报，持有其会话的写许可。
struct Stalled<P, H>
where
    P: Protocol,
    H: MessageProcessor<P::Message>,
{
    session: Arc<UdpSession<P, H>>,
    buffer: BufferHandle,
    permit: WritePermit,
}

impl<P, H> UdpCore<P, H>
where
    P: Protocol,
    H: MessageProcessor<P::Message>,
{
    /// 取出或创建远端地址对应的会话；创建者负责派发 `NewSession`。
    pub(crate) fn session(&self, remote: SocketAddr) -> Arc<UdpSession<P, H>> {
        if let Some(existing) = self.sessions.get(&remote) {
            return Arc::clone(existing.value());
        }
        let mut created = false;
        let session = Arc::clone(
            self.sessions
                .entry(remote)
                .or_insert_with(|| {
                    created = true;
                    Arc::new(UdpSession::new(
                        remote,
                        self.write_queue_capacity,
                        self.me.clone(),
                    ))
                })
                .value(),
        );
        if created {
            session.open();
        }
        session
    }

    /// 标记远端地址有待写数据报并唤醒接收任务。
    pub(crate) fn schedule(&self, remote: SocketAddr) {
        self.dirty.lock().insert(remote);
        self.wake.notify_one();
    }

    /// 会话关闭后从登记表移除；同一地址已被新会话占用时保持不变。
    pub(crate) fn forget(&self, remote: SocketAddr, id: SessionId) {
        self.sessions.remove_if(&remote, |_, session| session.id() == id);
    }

    fn snapshot(&self) -> Vec<Arc<UdpSession<P, H>>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    // ---- 读路径 ----

    /// 每个数据报恰好解码一次；解码结果为空的数据报被丢弃。
    fn on_datagram(&self, buffer: &mut BufferHandle, remote: SocketAddr) {
        let session = self.session(remote);
        let decoded = self.protocol.decode(buffer, &*session);
        buffer.clear();
        match decoded {
            Ok(Some(message)) => self.deliver(session, message),
            Ok(None) => {
                tracing::debug!(session = %session.id(), peer = %remote, "decode null, datagram dropped");
            }
            Err(error) => session.fail(SessionEvent::DecodeException, TransportError::Decode(error)),
        }
    }

    /// 无分片线程时在接收任务上同步处理；否则按远端地址哈希投递到固定分片。
    fn deliver(&self, session: Arc<UdpSession<P, H>>, message: P::Message) {
        if self.shards.is_empty() {
            worker::process(&*self.processor, &session, message);
            return;
        }
        let shard = (self.hasher.hash_one(session.remote()) % self.shards.len() as u64) as usize;
        let ring = &self.shards[shard];
        let delivery = match ring.try_publish((session, message)) {
            Ok(()) => return,
            Err(delivery) => delivery,
        };
        let rejected = tokio::task::block_in_place(|| ring.publish_timeout(delivery, self.publish_timeout));
        if let Err((session, message)) = rejected {
            tracing::warn!(shard, "udp worker ring full, processing on receiver");
            worker::process(&*self.processor, &session, message);
        }
    }

    // ---- 写路径 ----

    /// 先恢复挂起的数据报，再依次排空待写地址；套接字再次写满时其余地址留待下一轮。
    fn flush_writes(&self, stalled: &mut VecDeque<Stalled<P, H>>) {
        while let Some(parked) = stalled.pop_front() {
            if let Some(again) = self.pump(parked.session, parked.buffer, parked.permit) {
                stalled.push_front(again);
                return;
            }
        }
        let dirty: Vec<SocketAddr> = self.dirty.lock().drain().collect();
        for (index, remote) in dirty.iter().enumerate() {
            let Some(session) = self.sessions.get(remote).map(|entry| Arc::clone(entry.value()))
            else {
                continue;
            };
            match session.write_queue().begin() {
                Some((buffer, permit)) => {
                    if let Some(parked) = self.pump(session, buffer, permit) {
                        stalled.push_back(parked);
                        self.dirty.lock().extend(dirty[index + 1..].iter().copied());
                        return;
                    }
                }
                None => session.finish_if_closing(),
            }
        }
    }

    /// 写出会话队列直到排空；返回 `Some` 表示套接字暂不可写。
    fn pump(
        &self,
        session: Arc<UdpSession<P, H>>,
        mut buffer: BufferHandle,
        mut permit: WritePermit,
    ) -> Option<Stalled<P, H>> {
        loop {
            match self.socket.try_send_to(buffer.readable(), session.remote()) {
                Ok(_) => {
                    let sent = buffer.remaining();
                    buffer.advance(sent);
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    return Some(Stalled {
                        session,
                        buffer,
                        permit,
                    });
                }
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => {
                    buffer.release();
                    drop(permit);
                    session.fail(SessionEvent::WriteException, TransportError::io(SEND_TO, error));
                    return None;
                }
            }
            match session.write_queue().complete(buffer, permit) {
                WriteStep::Write(next, next_permit) => {
                    buffer = next;
                    permit = next_permit;
                }
                WriteStep::Idle => {
                    session.finish_if_closing();
                    return None;
                }
            }
        }
    }

    /// 接收任务：独占 `recv_from`，按需打开写兴趣。
    async fn run(self: Arc<Self>, mut read: BufferHandle, mut stop: watch::Receiver<bool>) {
        let mut stalled: VecDeque<Stalled<P, H>> = VecDeque::new();
        loop {
            tokio::select! {
                biased;
                _ = stop.changed() => break,
                received = self.socket.recv_from(read.spare_mut()) => match received {
                    Ok((length, remote)) => {
                        read.commit(length);
                        self.on_datagram(&mut read, remote);
                    }
                    Err(error) => tracing::warn!(%error, "udp recv_from failed"),
                },
                _ = self.wake.notified(), if stalled.is_empty() => {}
                ready = self.socket.writable(), if !stalled.is_empty() => {
                    if let Err(error) = ready {
                        tracing::warn!(%error, "udp socket writable wait failed");
                    }
                }
            }
            self.flush_writes(&mut stalled);
        }
        read.release();
        for parked in stalled {
            parked.buffer.release();
        }
        tracing::debug!("udp receiver stopped");
    }
}

/// `UdpMultiplexer` 在一个 UDP 套接字上复用任意多个以远端地址区分的逻辑会话。
///
/// # 意图（Why）
/// - 服务端只需绑定一个端口即可服务全部对端，客户端绑定临时端口后同样可以向多个对端收发；
/// - 每个远端地址对业务侧呈现为一个 [`UdpSession`]，拥有独立的状态、写队列与附件。
///
/// # 逻辑（How）
/// - 接收任务独占 `recv_from`：数据报读入复用的竞技场缓冲，按远端地址取出或创建会话，
///   调用一次 `Protocol::decode`；
/// - 解码出的消息按远端地址哈希投递到 `udp_workers` 个分片之一，每个分片拥有独立的
///   [`EventRing`] 与工作线程；`udp_workers == 0` 时在接收任务上同步处理；
///   分片事件环满且等待超时时在接收任务上处理，消息不会丢失；
/// - 写入先进入会话写队列，再把远端地址加入待写集合并通过 `Notify` 唤醒接收任务，
///   由接收任务执行 `try_send_to`；套接字写满时挂起在途数据报并等待可写。
///
/// # 契约（What）
/// - 同一远端地址的消息由同一分片按接收顺序处理；
/// - `shutdown` 幂等：停止接收任务、立即关闭全部会话（各自派发 `SessionClosed`）、
///   排空分片后停止运行时；`Drop` 时自动执行。
pub struct UdpMultiplexer<P, H>
where
    P: Protocol,
    H: MessageProcessor<P::Message>,
{
    core: Arc<UdpCore<P, H>>,
    local_addr: SocketAddr,
    stop: watch::Sender<bool>,
    receiver: Mutex<Option<tokio::task::JoinHandle<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl<P, H> UdpMultiplexer<P, H>
where
    P: Protocol,
    H: MessageProcessor<P::Message>,
{
    /// 绑定 `config.host:config.port`（端口 0 取临时端口）并启动接收任务与分片线程。
    pub fn bind(config: TransportConfig, protocol: P, processor: H) -> Result<Self, ServiceError> {
        let group = IoGroup::datagram(&config)?;
        let addr = config.bind_addr()?;
        let socket = {
            let _runtime = group.handle().enter();
            bind_socket(addr, &config.socket).map_err(|error| TransportError::io(BIND, error))?
        };
        let local_addr = socket
            .local_addr()
            .map_err(|error| TransportError::io(BIND, error))?;

        let shards = (0..config.udp_workers)
            .map(|_| Arc::new(EventRing::new(config.ring_capacity)))
            .collect();
        let core = Arc::new_cyclic(|me| UdpCore {
            socket,
            protocol: Arc::new(protocol),
            processor: Arc::new(processor),
            group,
            sessions: DashMap::new(),
            dirty: Mutex::new(HashSet::new()),
            wake: Notify::new(),
            shards,
            hasher: RandomState::new(),
            publish_timeout: config.ring_publish_timeout(),
            write_queue_capacity: config.write_queue_capacity,
            me: me.clone(),
        });

        let mut workers = Vec::with_capacity(core.shards.len());
        for (index, ring) in core.shards.iter().enumerate() {
            match worker::spawn(index, Arc::clone(ring), Arc::clone(&core.processor)) {
                Ok(handle) => workers.push(handle),
                Err(error) => {
                    for ring in &core.shards {
                        ring.close();
                    }
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(TransportError::io(RUNTIME, error).into());
                }
            }
        }

        let read = core.group.arena().allocate(config.read_buffer_size);
        let (stop, stop_rx) = watch::channel(false);
        let receiver = core.group.handle().spawn(Arc::clone(&core).run(read, stop_rx));
        tracing::info!(%local_addr, workers = config.udp_workers, "udp multiplexer bound");
        Ok(Self {
            core,
            local_addr,
            stop,
            receiver: Mutex::new(Some(receiver)),
            workers: Mutex::new(workers),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 取出或创建与 `remote` 对应的会话，用于主动向对端发送。
    pub fn session(&self, remote: SocketAddr) -> Arc<UdpSession<P, H>> {
        self.core.session(remote)
    }

    /// 当前存活的全部会话。
    pub fn sessions(&self) -> Vec<Arc<UdpSession<P, H>>> {
        self.core.snapshot()
    }

    pub fn processor(&self) -> &Arc<H> {
        &self.core.processor
    }

    pub fn group(&self) -> &Arc<IoGroup> {
        &self.core.group
    }

    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop.send_replace(true);
        let receiver = self.receiver.lock().take();
        if let Some(receiver) = receiver {
            let drained = self.core.group.block_on(async {
                let _ = tokio::time::timeout(SHUTDOWN_GRACE, receiver).await;
            });
            if drained.is_err() {
                tracing::debug!("udp receiver left to runtime shutdown");
            }
        }
        for session in self.core.snapshot() {
            session.close(true);
        }
        for ring in &self.core.shards {
            ring.close();
        }
        let current = thread::current().id();
        for handle in self.workers.lock().drain(..) {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
        self.core.group.shutdown();
        tracing::info!(local_addr = %self.local_addr, "udp multiplexer stopped");
    }
}

impl<P, H> Drop for UdpMultiplexer<P, H>
where
    P: Protocol,
    H: MessageProcessor<P::Message>,
{
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<P, H> fmt::Debug for UdpMultiplexer<P, H>
where
    P: Protocol,
    H: MessageProcessor<P::Message>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpMultiplexer")
            .field("local_addr", &self.local_addr)
            .field("sessions", &self.core.sessions.len())
            .field("shards", &self.core.shards.len())
            .finish()
    }
}

/// 创建数据报套接字；必须在 Tokio 运行时上下文内调用。
fn bind_socket(addr: SocketAddr, options: &SocketOptions) -> io::Result<UdpSocket> {
    let socket = Socket::new(
        Domain::for_address(addr),
        Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;
    if let Some(reuse) = options.reuse_address {
        socket.set_reuse_address(reuse)?;
    }
    if let Some(size) = options.send_buffer_size {
        socket.set_send_buffer_size(size)?;
    }
    if let Some(size) = options.recv_buffer_size {
        socket.set_recv_buffer_size(size)?;
    }
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}
