use std::{
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::Buf;
use parking_lot::Mutex;
use rustls::{ClientConfig, ServerConfig};
use rustls_pki_types::ServerName;
use spark_socket_core::{BufferArena, BufferHandle, TlsSettings, TransportError};
use spark_socket_tcp::{
    IoFuture, PlainTransport, StartFuture, StreamTransport, TransportFactory,
};
use tokio::net::TcpStream;

use crate::{
    config::client_config,
    engine::{APPLICATION_BUFFER_SIZE, EngineStatus, MAX_GROWTH_FACTOR, PACKET_BUFFER_SIZE, TlsEngine},
    error::TlsError,
    gate::HandshakeGate,
    reload::ReloadableServerConfig,
};

/// 引擎与其三块竞技场缓冲；通道关闭时整体归还。
struct TlsState {
    engine: TlsEngine,
    /// 从套接字读到、尚未交给引擎的密文。
    net_in: BufferHandle,
    /// 引擎产出、尚未写入套接字的密文。
    net_out: BufferHandle,
    /// 已解密、尚未交给会话读缓冲的明文。
    staging: BufferHandle,
}

impl TlsState {
    fn release(self) {
        self.net_in.release();
        self.net_out.release();
        self.staging.release();
    }
}

enum Step {
    Done,
    Again,
    Readable,
    Writable,
}

/// `TlsTransport` 以组合方式持有一个 [`PlainTransport`]，对会话呈现同样的 [`StreamTransport`] 能力。
///
/// # 意图（Why）
/// - 会话不感知加密层：明文读写、就绪等待与关闭的契约与明文通道一致；
/// - 握手是独立阶段，由 `start` 返回的 future 在运行时上驱动。
///
/// # 逻辑（How）
/// - 读：先交付暂存明文；否则让引擎解密已缓存的密文；仍不足时从套接字读取密文；
///   密文缓冲在压缩后仍满时按倍数扩容，明文暂存缓冲在引擎报告溢出时扩容，上限均为初始容量的 4 倍；
/// - 写：明文交给引擎加密，产出的密文立即尝试写出，未写完的部分保留在 `net_out`，
///   由后续写入或 `flush_pending` 继续冲刷；
/// - 握手完成前的读写在 [`HandshakeGate`] 上阻塞等待。
///
/// # 契约（What）
/// - `shutdown` 排入 `close_notify` 并尽力写出，随后关闭套接字并归还全部缓冲；幂等；
/// - 对端关闭（`close_notify` 或 EOF）表现为 `try_read` 返回 `Ok(0)`。
pub struct TlsTransport {
    plain: PlainTransport,
    state: Mutex<Option<TlsState>>,
    gate: HandshakeGate,
    limits: Limits,
    shut: AtomicBool,
    /// 读路径上冲刷回应记录时遇到的错误，留给下一次 `flush_pending` 上报。
    deferred_error: Mutex<Option<io::Error>>,
}

#[derive(Clone, Copy, Debug)]
struct Limits {
    packet: usize,
    application: usize,
}

impl TlsTransport {
    pub fn new(plain: PlainTransport, engine: TlsEngine, arena: &BufferArena) -> Self {
        let state = TlsState {
            engine,
            net_in: arena.allocate(PACKET_BUFFER_SIZE),
            net_out: arena.allocate(PACKET_BUFFER_SIZE),
            staging: arena.allocate(APPLICATION_BUFFER_SIZE),
        };
        Self {
            plain,
            state: Mutex::new(Some(state)),
            gate: HandshakeGate::new(),
            limits: Limits {
                packet: PACKET_BUFFER_SIZE * MAX_GROWTH_FACTOR,
                application: APPLICATION_BUFFER_SIZE * MAX_GROWTH_FACTOR,
            },
            shut: AtomicBool::new(false),
            deferred_error: Mutex::new(None),
        }
    }

    pub fn is_handshake_complete(&self) -> bool {
        self.gate.is_open()
    }

    async fn drive_handshake(&self) -> Result<(), TransportError> {
        loop {
            let step = self
                .handshake_step()
                .map_err(|error| TransportError::Handshake(Box::new(error)))?;
            match step {
                Step::Done => return Ok(()),
                Step::Again => continue,
                Step::Readable => self
                    .plain
                    .readable()
                    .await
                    .map_err(|error| TransportError::Handshake(Box::new(error)))?,
                Step::Writable => self
                    .plain
                    .writable()
                    .await
                    .map_err(|error| TransportError::Handshake(Box::new(error)))?,
            }
        }
    }

    fn handshake_step(&self) -> Result<Step, TlsError> {
        let mut guard = self.state.lock();
        let Some(state) = guard.as_mut() else {
            return Err(closed_error().into());
        };
        match self.flush_locked(state) {
            Ok(()) => {}
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(Step::Writable),
            Err(error) => return Err(error.into()),
        }
        if !state.engine.is_handshaking() {
            return Ok(Step::Done);
        }
        match state.engine.unwrap(&mut state.net_in, &mut state.staging) {
            Ok(EngineStatus::Closed) => return Err(closed_error().into()),
            // 引擎消费对端的一轮握手消息后排入了回应（或握手已结束）：先写出，再等待读。
            Ok(EngineStatus::BufferUnderflow)
                if state.engine.wants_write() || !state.engine.is_handshaking() =>
            {
                return Ok(Step::Again);
            }
            Ok(EngineStatus::BufferUnderflow) => {}
            Ok(EngineStatus::BufferOverflow) => {
                grow_within(&mut state.staging, self.limits.application)?;
                return Ok(Step::Again);
            }
            Ok(EngineStatus::Ok) => return Ok(Step::Again),
            Err(error) => {
                // 告警已由引擎排入发送缓冲，尽力告知对端。
                let _ = self.flush_locked(state);
                return Err(error);
            }
        }
        self.prepare_net_in(state)?;
        match self.plain.try_read(&mut state.net_in) {
            Ok(0) => Err(closed_error().into()),
            Ok(_) => Ok(Step::Again),
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => Ok(Step::Readable),
            Err(error) => Err(error.into()),
        }
    }

    /// 把引擎内的密文经 `net_out` 全部写出套接字；写不完返回 `WouldBlock`。
    fn flush_locked(&self, state: &mut TlsState) -> io::Result<()> {
        loop {
            if state.net_out.is_empty() {
                state.net_out.clear();
                state
                    .engine
                    .drain_ciphertext(&mut state.net_out)
                    .map_err(TlsError::into_io)?;
                if state.net_out.is_empty() {
                    return Ok(());
                }
            }
            self.plain.try_write(&mut state.net_out)?;
        }
    }

    /// 确保密文缓冲有空闲区：先压缩，再按倍数扩容。
    fn prepare_net_in(&self, state: &mut TlsState) -> Result<(), TlsError> {
        state.net_in.compact();
        if state.net_in.spare() == 0 {
            grow_within(&mut state.net_in, self.limits.packet)?;
        }
        Ok(())
    }

    fn read_locked(&self, state: &mut TlsState, dst: &mut BufferHandle) -> io::Result<usize> {
        loop {
            if !state.staging.is_empty() {
                let n = dst.put_slice(state.staging.readable());
                state.staging.advance(n);
                if state.staging.is_empty() {
                    state.staging.clear();
                }
                return Ok(n);
            }
            let status = state
                .engine
                .unwrap(&mut state.net_in, &mut state.staging)
                .map_err(TlsError::into_io)?;
            match status {
                EngineStatus::Ok => {}
                EngineStatus::Closed => return Ok(0),
                EngineStatus::BufferOverflow => {
                    grow_within(&mut state.staging, self.limits.application)
                        .map_err(TlsError::into_io)?;
                }
                EngineStatus::BufferUnderflow => {
                    self.prepare_net_in(state).map_err(TlsError::into_io)?;
                    if self.plain.try_read(&mut state.net_in)? == 0 {
                        return Ok(0);
                    }
                }
            }
        }
    }
}

impl StreamTransport for TlsTransport {
    fn start(&self) -> StartFuture<'_> {
        Box::pin(async move {
            let outcome = self.drive_handshake().await;
            match &outcome {
                Ok(()) => {
                    tracing::debug!(peer = ?self.plain.peer_addr().ok(), "tls handshake completed");
                    self.gate.open();
                }
                Err(error) => {
                    tracing::warn!(peer = ?self.plain.peer_addr().ok(), %error, "tls handshake failed");
                    self.gate.fail();
                }
            }
            outcome
        })
    }

    fn is_secure(&self) -> bool {
        true
    }

    fn try_read(&self, dst: &mut BufferHandle) -> io::Result<usize> {
        if dst.spare() == 0 {
            return Err(io::Error::other("read buffer has no spare capacity"));
        }
        if !self.gate.wait() {
            return Err(handshake_incomplete());
        }
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or_else(closed_error)?;
        let result = self.read_locked(state, dst);
        // 读取可能促使引擎产生回应记录（如密钥更新、告警）；写不完的部分留在 `net_out`，
        // 由会话经 `has_pending_output` 发现后在可写时冲刷，其他错误在那次冲刷中上报。
        if state.engine.wants_write() {
            match self.flush_locked(state) {
                Ok(()) => {}
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {}
                Err(error) => {
                    tracing::debug!(%error, "tls records produced by read not flushed");
                    *self.deferred_error.lock() = Some(error);
                }
            }
        }
        result
    }

    fn has_pending_output(&self) -> bool {
        if self.deferred_error.lock().is_some() {
            return true;
        }
        self.state.lock().as_ref().is_some_and(|state| {
            !state.net_out.is_empty() || state.engine.wants_write()
        })
    }

    fn readable(&self) -> IoFuture<'_> {
        self.plain.readable()
    }

    fn try_write(&self, src: &mut BufferHandle) -> io::Result<usize> {
        if !src.has_remaining() {
            return Ok(0);
        }
        if !self.gate.wait() {
            return Err(handshake_incomplete());
        }
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or_else(closed_error)?;
        for _ in 0..2 {
            let before = src.remaining();
            let status = state
                .engine
                .wrap(src, &mut state.net_out)
                .map_err(TlsError::into_io)?;
            if status == EngineStatus::Closed {
                return Err(closed_error());
            }
            let consumed = before - src.remaining();
            match self.flush_locked(state) {
                Ok(()) => {}
                Err(error) if error.kind() == io::ErrorKind::WouldBlock && consumed > 0 => {}
                Err(error) => return Err(error),
            }
            if consumed > 0 {
                return Ok(consumed);
            }
        }
        Err(io::ErrorKind::WouldBlock.into())
    }

    fn flush_pending(&self) -> io::Result<()> {
        if let Some(error) = self.deferred_error.lock().take() {
            return Err(error);
        }
        let mut guard = self.state.lock();
        match guard.as_mut() {
            Some(state) => self.flush_locked(state),
            None => Ok(()),
        }
    }

    fn writable(&self) -> IoFuture<'_> {
        self.plain.writable()
    }

    fn shutdown(&self) {
        if self.shut.swap(true, Ordering::AcqRel) {
            return;
        }
        let state = self.state.lock().take();
        if let Some(mut state) = state {
            if !state.engine.is_closed() {
                state.engine.close();
                if let Err(error) = self.flush_locked(&mut state)
                    && error.kind() != io::ErrorKind::WouldBlock
                {
                    tracing::debug!(%error, "close_notify not delivered");
                }
            }
            state.release();
        }
        self.gate.fail();
        self.plain.shutdown();
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.plain.local_addr()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.plain.peer_addr()
    }
}

impl Drop for TlsTransport {
    fn drop(&mut self) {
        if let Some(state) = self.state.get_mut().take() {
            state.release();
        }
    }
}

impl std::fmt::Debug for TlsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsTransport")
            .field("plain", &self.plain)
            .field("handshake_complete", &self.gate.is_open())
            .finish_non_exhaustive()
    }
}

fn grow_within(buffer: &mut BufferHandle, limit: usize) -> Result<(), TlsError> {
    let next = buffer.capacity().saturating_mul(2).min(limit);
    if next <= buffer.capacity() {
        tracing::warn!(capacity = buffer.capacity(), limit, "tls engine buffer overflow");
        return Err(TlsError::Overflow { limit });
    }
    tracing::debug!(from = buffer.capacity(), to = next, "growing tls engine buffer");
    buffer.grow(next);
    Ok(())
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "tls transport closed")
}

fn handshake_incomplete() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "tls handshake did not complete")
}

/// 为接入连接创建服务端 TLS 通道；配置可热替换。
#[derive(Clone, Debug)]
pub struct TlsServerFactory {
    config: ReloadableServerConfig,
}

impl TlsServerFactory {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self {
            config: ReloadableServerConfig::new(config),
        }
    }

    pub fn from_settings(settings: &TlsSettings) -> Result<Self, TlsError> {
        Ok(Self::new(Arc::new(crate::config::server_config(settings)?)))
    }

    pub fn reloadable(&self) -> &ReloadableServerConfig {
        &self.config
    }
}

impl TransportFactory for TlsServerFactory {
    fn wrap(
        &self,
        stream: TcpStream,
        arena: &BufferArena,
    ) -> Result<Box<dyn StreamTransport>, TransportError> {
        let engine = TlsEngine::server(self.config.snapshot())
            .map_err(|error| TransportError::Handshake(Box::new(error)))?;
        Ok(Box::new(TlsTransport::new(PlainTransport::new(stream), engine, arena)))
    }
}

/// 为出站连接创建客户端 TLS 通道，并以 `server_name` 校验服务端证书。
#[derive(Clone, Debug)]
pub struct TlsClientFactory {
    config: Arc<ClientConfig>,
    server_name: ServerName<'static>,
}

impl TlsClientFactory {
    pub fn new(config: Arc<ClientConfig>, server_name: &str) -> Result<Self, TlsError> {
        Ok(Self {
            config,
            server_name: ServerName::try_from(server_name.to_owned())?,
        })
    }

    pub fn from_settings(settings: &TlsSettings, server_name: &str) -> Result<Self, TlsError> {
        Self::new(Arc::new(client_config(settings)?), server_name)
    }
}

impl TransportFactory for TlsClientFactory {
    fn wrap(
        &self,
        stream: TcpStream,
        arena: &BufferArena,
    ) -> Result<Box<dyn StreamTransport>, TransportError> {
        let engine = TlsEngine::client(Arc::clone(&self.config), self.server_name.clone())
            .map_err(|error| TransportError::Handshake(Box::new(error)))?;
        Ok(Box::new(TlsTransport::new(PlainTransport::new(stream), engine, arena)))
    }
}
