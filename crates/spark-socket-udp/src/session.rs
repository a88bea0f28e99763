use std::{
    fmt,
    net::SocketAddr,
    sync::{
        Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use spark_socket_core::{
    Attachment, AttachmentSlot, MessageProcessor, Protocol, SendError, Session, SessionEvent,
    SessionId, SessionState, SessionStateCell, TransportError, WriteQueue, WriteRejected,
    error::RECV_FROM, write_message,
};

use crate::multiplexer::UdpCore;

/// `UdpSession` 是共享 UDP 套接字上以远端地址区分的逻辑会话。
///
/// # 意图（Why）
/// - UDP 没有连接，但业务侧仍希望按对端维护状态、写入与关闭；
///   逻辑会话让 UDP 与 TCP 共用同一个 [`Session`] 能力接口；
/// - 每个远端地址拥有独立的有界写队列，一个慢对端的背压不会波及其他对端。
///
/// # 逻辑（How）
/// - `write` 把一个完整数据报拷贝进竞技场缓冲入队，再把远端地址标记为“待写”并唤醒接收任务；
///   真正的 `send_to` 只发生在接收任务上，每个缓冲恰好对应一个数据报；
/// - `close(false)` 在写队列非空时进入 `Closing`，由接收任务排空后完成关闭。
///
/// # 契约（What）
/// - 首次出现的远端地址（收到数据报或调用方主动取会话）创建会话并派发 `NewSession`；
/// - 关闭后从复用器中移除，同一地址的后续数据报会创建新的会话；
/// - 重复关闭为空操作，仅首次记录一条告警。
pub struct UdpSession<P, H>
where
    P: Protocol,
    H: MessageProcessor<P::Message>,
{
    id: SessionId,
    remote: SocketAddr,
    state: SessionStateCell,
    write_queue: WriteQueue,
    attachment: AttachmentSlot,
    repeated_close_logged: AtomicBool,
    core: Weak<UdpCore<P, H>>,
}

impl<P, H> UdpSession<P, H>
where
    P: Protocol,
    H: MessageProcessor<P::Message>,
{
    pub(crate) fn new(
        remote: SocketAddr,
        write_queue_capacity: usize,
        core: Weak<UdpCore<P, H>>,
    ) -> Self {
        Self {
            id: SessionId::next(),
            remote,
            state: SessionStateCell::new(),
            write_queue: WriteQueue::new(write_queue_capacity),
            attachment: AttachmentSlot::default(),
            repeated_close_logged: AtomicBool::new(false),
            core,
        }
    }

    /// 用复用器的协议编码并写入一条消息。
    pub fn send(&self, message: &P::Message) -> Result<(), SendError> {
        let core = self.core.upgrade().ok_or(WriteRejected::Closed)?;
        write_message(self, &*core.protocol, message)
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// 写队列中尚未发出的数据报数。
    pub fn pending_writes(&self) -> usize {
        self.write_queue.len()
    }

    pub(crate) fn write_queue(&self) -> &WriteQueue {
        &self.write_queue
    }

    pub(crate) fn open(&self) {
        if self.state.advance(SessionState::Enabled).is_applied() {
            tracing::debug!(session = %self.id, peer = %self.remote, "udp session opened");
            self.emit(SessionEvent::NewSession, None);
        }
    }

    pub(crate) fn emit(&self, event: SessionEvent, error: Option<&TransportError>) {
        if let Some(core) = self.core.upgrade() {
            core.processor.state_event(Some(self as &dyn Session), event, error);
        }
    }

    /// 上报致命错误并立即关闭。
    pub(crate) fn fail(&self, event: SessionEvent, error: TransportError) {
        if self.state.get() == SessionState::Closed {
            return;
        }
        tracing::debug!(session = %self.id, %event, code = error.code(), %error, "udp session failed");
        self.emit(event, Some(&error));
        self.close(true);
    }

    pub(crate) fn finish_if_closing(&self) {
        if self.state.get() == SessionState::Closing && self.write_queue.is_idle() {
            self.finish_close();
        }
    }

    fn finish_close(&self) {
        if !self.state.advance(SessionState::Closed).is_applied() {
            return;
        }
        for buffer in self.write_queue.close() {
            buffer.release();
        }
        self.attachment.take();
        if let Some(core) = self.core.upgrade() {
            core.forget(self.remote, self.id);
        }
        tracing::debug!(session = %self.id, peer = %self.remote, "udp session closed");
        self.emit(SessionEvent::SessionClosed, None);
    }
}

impl<P, H> Session for UdpSession<P, H>
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
        let core = self.core.upgrade().ok_or(WriteRejected::Closed)?;
        let mut buffer = core.group.arena().allocate(data.len());
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
        core.schedule(self.remote);
        Ok(())
    }

    fn close(&self, immediate: bool) {
        if self.state.get() == SessionState::Closed {
            if !self.repeated_close_logged.swap(true, Ordering::Relaxed) {
                tracing::warn!(session = %self.id, "ignore, session already closed");
            }
            return;
        }
        if immediate || self.write_queue.is_idle() {
            self.finish_close();
            return;
        }
        if self.state.advance(SessionState::Closing).is_applied() {
            self.emit(SessionEvent::SessionClosing, None);
        }
        match self.core.upgrade() {
            Some(core) => core.schedule(self.remote),
            None => self.finish_close(),
        }
    }

    fn state(&self) -> SessionState {
        self.state.get()
    }

    fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        if self.state.get() == SessionState::Closed {
            return Err(TransportError::Closed);
        }
        let core = self.core.upgrade().ok_or(TransportError::Closed)?;
        core.socket
            .local_addr()
            .map_err(|error| TransportError::io(RECV_FROM, error))
    }

    fn remote_addr(&self) -> Result<SocketAddr, TransportError> {
        if self.state.get() == SessionState::Closed {
            return Err(TransportError::Closed);
        }
        Ok(self.remote)
    }

    fn attachment(&self) -> Option<Attachment> {
        self.attachment.get()
    }

    fn set_attachment(&self, value: Option<Attachment>) {
        self.attachment.set(value);
    }
}

impl<P, H> fmt::Debug for UdpSession<P, H>
where
    P: Protocol,
    H: MessageProcessor<P::Message>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpSession")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("state", &self.state.get())
            .field("pending_writes", &self.write_queue.len())
            .finish()
    }
}

