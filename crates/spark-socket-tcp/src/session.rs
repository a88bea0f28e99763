use std::{
    fmt, io,
    net::SocketAddr,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::Buf;
use parking_lot::Mutex;
use spark_socket_core::{
    Attachment, AttachmentSlot, BufferHandle, MessageProcessor, Protocol, SendError, Session,
    SessionEvent, SessionId, SessionState, SessionStateCell, TransportError, WritePermit,
    WriteQueue, WriteRejected, WriteStep,
    error::{READ, WRITE},
    process_guarded, write_message,
};
use tokio::sync::{oneshot, watch};

use crate::{group::IoGroup, transport::StreamTransport};

/// 同一服务端/客户端创建的全部会话共享的上下文。
pub(crate) struct SessionContext<P, H> {
    pub(crate) protocol: Arc<P>,
    pub(crate) processor: Arc<H>,
    pub(crate) group: Arc<IoGroup>,
    pub(crate) read_buffer_size: usize,
    pub(crate) write_queue_capacity: usize,
}

enum ReadAttempt {
    Ready(io::Result<usize>),
    Pending,
    Closed,
}

/// `StreamSession` 是一条 TCP 连接上的会话，通道实现（明文或 TLS）在构造时选定。
///
/// # 意图（Why）
/// - 把“读完成 → 解码 → 业务派发 → 重新发起读”的循环与单写者写泵封装在一处，
///   业务侧只面对 [`Session`] 能力接口；
/// - 关闭流程由状态机唯一的迁移函数守护，缓冲归还、通道关闭与 `SessionClosed`
///   事件恰好执行一次。
///
/// # 逻辑（How）
/// - 读：`try_read` 立即完成则经 [`ReadDispatcher`](spark_socket_core::ReadDispatcher)
///   派发，否则在运行时上等待可读后重试；读缓冲在一次完成回调期间从槽位中取出独占使用；
/// - 写：`write` 拷贝进竞技场缓冲后入队，随后尝试成为写者；通道写满时持有许可
///   挂起等待可写，完成后由 [`WriteQueue::complete`] 决定下一步；
/// - 关闭：`close(true)` 立即拆除；`close(false)` 在写队列为空时等同立即关闭，
///   否则进入 `Closing`，由写泵在排空后完成拆除。
///
/// # 契约（What）
/// - 事件顺序：`NewSession` →（TLS）`HandshakeCompleted` → … → `SessionClosed`；
/// - 解码错误、读缓冲写满而无可解码消息、通道读写错误都是致命的；
///   `process` 的错误与 panic 只上报 `ProcessException`；
/// - 重复关闭为空操作，仅首次记录一条告警。
pub struct StreamSession<P, H>
where
    P: Protocol,
    H: MessageProcessor<P::Message>,
{
    id: SessionId,
    state: SessionStateCell,
    transport: Box<dyn StreamTransport>,
    ctx: Arc<SessionContext<P, H>>,
    read_buffer: Mutex<Option<BufferHandle>>,
    write_queue: WriteQueue,
    attachment: AttachmentSlot,
    closed_tx: watch::Sender<bool>,
    repeated_close_logged: AtomicBool,
    me: Weak<Self>,
}

impl<P, H> StreamSession<P, H>
where
    P: Protocol,
    H: MessageProcessor<P::Message>,
{
    pub(crate) fn open(
        ctx: Arc<SessionContext<P, H>>,
        transport: Box<dyn StreamTransport>,
    ) -> Arc<Self> {
        let read_buffer = ctx.group.arena().allocate(ctx.read_buffer_size);
        let write_queue = WriteQueue::new(ctx.write_queue_capacity);
        let (closed_tx, _) = watch::channel(false);
        let session = Arc::new_cyclic(|me| Self {
            id: SessionId::next(),
            state: SessionStateCell::new(),
            transport,
            ctx,
            read_buffer: Mutex::new(Some(read_buffer)),
            write_queue,
            attachment: AttachmentSlot::default(),
            closed_tx,
            repeated_close_logged: AtomicBool::new(false),
            me: me.clone(),
        });

        session
            .ctx
            .group
            .register(Arc::clone(&session) as Arc<dyn Session>);
        session.state.advance(SessionState::Enabled);
        tracing::debug!(
            session = %session.id,
            peer = ?session.transport.peer_addr().ok(),
            secure = session.transport.is_secure(),
            "session opened"
        );
        if session.transport.is_secure() {
            // 握手任务先于 `NewSession` 启动：事件回调内的写入会在握手闸门上等待。
            let (announced, wait_announced) = oneshot::channel();
            session.spawn_handshake(wait_announced);
            session.emit(SessionEvent::NewSession, None);
            let _ = announced.send(());
        } else {
            session.emit(SessionEvent::NewSession, None);
            session.arm_read();
        }
        session
    }

    /// 用会话协议编码并写入一条消息。
    pub fn send(&self, message: &P::Message) -> Result<(), SendError> {
        write_message(self, &*self.ctx.protocol, message)
    }

    pub fn is_secure(&self) -> bool {
        self.transport.is_secure()
    }

    /// 写队列中尚未开始写出的缓冲数。
    pub fn pending_writes(&self) -> usize {
        self.write_queue.len()
    }

    fn as_session(&self) -> &dyn Session {
        self
    }

    fn emit(&self, event: SessionEvent, error: Option<&TransportError>) {
        self.ctx
            .processor
            .state_event(Some(self.as_session()), event, error);
    }

    /// 上报致命错误并立即关闭；会话已关闭时静默丢弃。
    fn fail(&self, event: SessionEvent, error: TransportError) {
        if self.state.get() == SessionState::Closed {
            return;
        }
        tracing::debug!(session = %self.id, %event, code = error.code(), %error, "session failed");
        self.emit(event, Some(&error));
        self.close(true);
    }

    /// 驱动通道启动阶段；`HandshakeCompleted` 总在 `NewSession` 之后、首次读取之前交付。
    fn spawn_handshake(self: &Arc<Self>, announced: oneshot::Receiver<()>) {
        let session = Arc::clone(self);
        let closed = self.closed_tx.subscribe();
        self.ctx.group.handle().spawn(async move {
            let outcome = tokio::select! {
                _ = wait_closed(closed) => return,
                outcome = session.transport.start() => outcome,
            };
            let _ = announced.await;
            match outcome {
                Ok(()) => {
                    session.emit(SessionEvent::HandshakeCompleted, None);
                    session.arm_read();
                    // 握手尾部的密文可能仍缓存在通道内。
                    session.flush();
                    session.after_drain();
                }
                Err(error) => session.fail(SessionEvent::ReadException, error),
            }
        });
    }

    // ---- 读路径 ----

    fn arm_read(self: &Arc<Self>) {
        match self.try_read_now() {
            ReadAttempt::Ready(result) => self.complete_read(result),
            ReadAttempt::Pending => {
                self.flush_read_output();
                let session = Arc::clone(self);
                let closed = self.closed_tx.subscribe();
                self.ctx
                    .group
                    .handle()
                    .spawn(async move { session.await_readable(closed).await });
            }
            ReadAttempt::Closed => {}
        }
    }

    fn try_read_now(&self) -> ReadAttempt {
        let mut slot = self.read_buffer.lock();
        let Some(buffer) = slot.as_mut() else {
            return ReadAttempt::Closed;
        };
        loop {
            match self.transport.try_read(buffer) {
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    return ReadAttempt::Pending;
                }
                result => return ReadAttempt::Ready(result),
            }
        }
    }

    async fn await_readable(self: Arc<Self>, closed: watch::Receiver<bool>) {
        let closed = wait_closed(closed);
        tokio::pin!(closed);
        loop {
            tokio::select! {
                _ = &mut closed => return,
                ready = self.transport.readable() => {
                    if let Err(error) = ready {
                        self.complete_read(Err(error));
                        return;
                    }
                }
            }
            match self.try_read_now() {
                ReadAttempt::Ready(result) => {
                    self.complete_read(result);
                    return;
                }
                ReadAttempt::Pending => self.flush_read_output(),
                ReadAttempt::Closed => return,
            }
        }
    }

    /// 通道在读取时产生了待发字节（TLS 密钥更新回应、告警）：与写泵共用冲刷路径。
    fn flush_read_output(self: &Arc<Self>) {
        if self.state.get() != SessionState::Closed && self.transport.has_pending_output() {
            self.after_drain();
        }
    }

    fn complete_read(self: &Arc<Self>, result: io::Result<usize>) {
        let session = Arc::clone(self);
        self.ctx.group.dispatch(move || session.on_read(result));
    }

    fn on_read(self: &Arc<Self>, result: io::Result<usize>) {
        let eof = match result {
            Ok(n) => n == 0,
            Err(error) => {
                self.fail(SessionEvent::ReadException, TransportError::io(READ, error));
                return;
            }
        };
        let Some(mut buffer) = self.read_buffer.lock().take() else {
            return;
        };

        while buffer.has_remaining() && self.state.get() == SessionState::Enabled {
            match self.ctx.protocol.decode(&mut buffer, self.as_session()) {
                Ok(Some(message)) => {
                    if let Err(error) =
                        process_guarded(&*self.ctx.processor, self.as_session(), message)
                    {
                        tracing::debug!(session = %self.id, %error, "process failed");
                        self.emit(SessionEvent::ProcessException, Some(&error));
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    buffer.release();
                    self.fail(SessionEvent::DecodeException, TransportError::Decode(error));
                    return;
                }
            }
        }

        match self.state.get() {
            SessionState::Closed => {
                buffer.release();
                return;
            }
            SessionState::Closing => {
                buffer.release();
                self.emit(SessionEvent::InputShutdown, None);
                self.close(false);
                return;
            }
            _ if eof => {
                buffer.release();
                self.emit(SessionEvent::InputShutdown, None);
                self.close(false);
                return;
            }
            _ => {}
        }

        buffer.compact();
        if buffer.is_full() {
            let capacity = buffer.capacity();
            buffer.release();
            self.fail(
                SessionEvent::DecodeException,
                TransportError::BufferOverflow { capacity },
            );
            return;
        }

        {
            let mut slot = self.read_buffer.lock();
            if self.state.get() == SessionState::Closed {
                drop(slot);
                buffer.release();
                return;
            }
            *slot = Some(buffer);
        }
        self.flush_read_output();
        self.arm_read();
    }

    // ---- 写路径 ----

    fn flush(self: &Arc<Self>) {
        if let Some((buffer, permit)) = self.write_queue.begin() {
            self.pump(WriteStep::Write(buffer, permit));
        }
    }

    fn pump(self: &Arc<Self>, mut step: WriteStep) {
        loop {
            let (mut buffer, permit) = match step {
                WriteStep::Write(buffer, permit) => (buffer, permit),
                WriteStep::Idle => {
                    self.after_drain();
                    return;
                }
            };
            if self.state.get() == SessionState::Closed {
                buffer.release();
                return;
            }
            match self.transport.try_write(&mut buffer) {
                Ok(_) => step = self.write_queue.complete(buffer, permit),
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {
                    step = WriteStep::Write(buffer, permit);
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    self.park_write(buffer, permit);
                    return;
                }
                Err(error) => {
                    buffer.release();
                    drop(permit);
                    self.fail(SessionEvent::WriteException, TransportError::io(WRITE, error));
                    return;
                }
            }
        }
    }

    /// 通道写满：带着缓冲与许可等待可写。
    fn park_write(self: &Arc<Self>, buffer: BufferHandle, permit: WritePermit) {
        let session = Arc::clone(self);
        let closed = self.closed_tx.subscribe();
        self.ctx.group.handle().spawn(async move {
            tokio::select! {
                _ = wait_closed(closed) => {
                    buffer.release();
                }
                ready = session.transport.writable() => match ready {
                    Ok(()) => session.pump(WriteStep::Write(buffer, permit)),
                    Err(error) => {
                        buffer.release();
                        drop(permit);
                        session.fail(SessionEvent::WriteException, TransportError::io(WRITE, error));
                    }
                },
            }
        });
    }

    /// 写队列排空后：冲刷通道内部待发字节，并在 `Closing` 时完成关闭。
    fn after_drain(self: &Arc<Self>) {
        match self.transport.flush_pending() {
            Ok(()) => self.finish_if_closing(),
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                let session = Arc::clone(self);
                let closed = self.closed_tx.subscribe();
                self.ctx.group.handle().spawn(async move {
                    tokio::select! {
                        _ = wait_closed(closed) => {}
                        ready = session.transport.writable() => match ready {
                            Ok(()) => session.after_drain(),
                            Err(error) => session.fail(
                                SessionEvent::WriteException,
                                TransportError::io(WRITE, error),
                            ),
                        },
                    }
                });
            }
            Err(error) => self.fail(SessionEvent::WriteException, TransportError::io(WRITE, error)),
        }
    }

    fn finish_if_closing(&self) {
        if self.state.get() == SessionState::Closing && self.write_queue.is_idle() {
            self.finish_close();
        }
    }

    // ---- 关闭 ----

    fn finish_close(&self) {
        if !self.state.advance(SessionState::Closed).is_applied() {
            return;
        }
        for buffer in self.write_queue.close() {
            buffer.release();
        }
        if let Some(buffer) = self.read_buffer.lock().take() {
            buffer.release();
        }
        self.closed_tx.send_replace(true);
        self.transport.shutdown();
        self.ctx.group.unregister(self.id);
        tracing::debug!(session = %self.id, "session closed");
        self.emit(SessionEvent::SessionClosed, None);
    }
}

impl<P, H> Session for StreamSession<P, H>
where
    P: Protocol,
    H: MessageProcessor<P::Message>,
{
    fn id(&self) -> SessionId {
        self.id
    }

    fn write(&self, data: &[u8]) -> Result<(), WriteRejected> {
        if self.state.get().is_terminal() {
            return Err(WriteRejected::Closed);
        }
        if data.is_empty() {
            return Ok(());
        }
        let mut buffer = self.ctx.group.arena().allocate(data.len());
        buffer.put_slice(data);
        if let Err(rejected) = self.write_queue.enqueue(buffer) {
            let closed = rejected.is_closed();
            rejected.into_buffer().release();
            return Err(if closed {
                WriteRejected::Closed
            } else {
                WriteRejected::Backpressure
            });
        }
        if let Some(session) = self.me.upgrade() {
            session.flush();
        }
        Ok(())
    }

    fn close(&self, immediate: bool) {
        if self.state.get() == SessionState::Closed {
            if !self.repeated_close_logged.swap(true, Ordering::Relaxed) {
                tracing::warn!(session = %self.id, "ignore, session already closed");
            }
            return;
        }
        if immediate {
            self.finish_close();
            return;
        }
        if self.write_queue.is_idle() && self.transport.flush_pending().is_ok() {
            self.finish_close();
            return;
        }
        if self.state.advance(SessionState::Closing).is_applied() {
            self.emit(SessionEvent::SessionClosing, None);
        }
        if let Some(session) = self.me.upgrade() {
            if self.write_queue.is_idle() {
                session.after_drain();
            } else {
                session.flush();
            }
        }
    }

    fn state(&self) -> SessionState {
        self.state.get()
    }

    fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        if self.state.get() == SessionState::Closed {
            return Err(TransportError::Closed);
        }
        self.transport
            .local_addr()
            .map_err(|error| TransportError::io(READ, error))
    }

    fn remote_addr(&self) -> Result<SocketAddr, TransportError> {
        if self.state.get() == SessionState::Closed {
            return Err(TransportError::Closed);
        }
        self.transport
            .peer_addr()
            .map_err(|error| TransportError::io(READ, error))
    }

    fn attachment(&self) -> Option<Attachment> {
        self.attachment.get()
    }

    fn set_attachment(&self, value: Option<Attachment>) {
        self.attachment.set(value);
    }
}

impl<P, H> fmt::Debug for StreamSession<P, H>
where
    P: Protocol,
    H: MessageProcessor<P::Message>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSession")
            .field("id", &self.id)
            .field("state", &self.state.get())
            .field("secure", &self.transport.is_secure())
            .field("pending_writes", &self.write_queue.len())
            .finish()
    }
}

/// 在会话关闭信号置位（或会话被丢弃）时完成。
async fn wait_closed(mut closed: watch::Receiver<bool>) {
    loop {
        let is_closed = *closed.borrow_and_update();
        if is_closed || closed.changed().await.is_err() {
            return;
        }
    }
}
