//! TLS 记录层引擎：在调用方提供的缓冲之间完成密文与明文的互相转换。
//!
//! # 教案式说明（Why）
//! - 引擎不接触套接字，只在竞技场缓冲之间搬运字节，
//!   因此既能被 [`TlsTransport`](crate::TlsTransport) 驱动，也能在单元测试中以内存对接；
//! - 每次调用返回一个 [`EngineStatus`]，调用方据此决定“读更多密文”“扩容”或“开始拆除”。
//!
//! # 契约说明（What）
//! - 从不以空输入调用 `read_tls`：空输入会被 `rustls` 视为对端 EOF；
//! - `unwrap` 先交付 `rustls` 内部已解密的明文，再消费新的密文；
//! - `wrap` 消费的明文字节数可能少于输入（内部发送缓冲达到上限），剩余部分由调用方重试。

use std::{
    io::{self, Read, Write},
    sync::Arc,
};

use bytes::Buf;
use rustls::{ClientConfig, ClientConnection, Connection, ServerConfig, ServerConnection};
use rustls_pki_types::ServerName;
use spark_socket_core::BufferHandle;

use crate::error::TlsError;

/// 一条 TLS 记录的最大线上长度，用作密文缓冲的初始容量。
pub const PACKET_BUFFER_SIZE: usize = 18_437;

/// 单条记录可承载的最大明文长度，用作明文暂存缓冲的初始容量。
pub const APPLICATION_BUFFER_SIZE: usize = 16_384;

/// 缓冲扩容的上限倍数（相对初始容量）。
pub const MAX_GROWTH_FACTOR: usize = 4;

/// 一次 `wrap`/`unwrap` 之后引擎的状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineStatus {
    /// 产生了输出（明文或密文），调用方可继续。
    Ok,
    /// 输入密文不足以构成完整记录，需要从通道读取更多字节。
    BufferUnderflow,
    /// 目标缓冲没有空闲空间，调用方需腾挪或扩容后重试。
    BufferOverflow,
    /// 对端已关闭 TLS 会话（`close_notify` 或无通知的 EOF）。
    Closed,
}

/// `TlsEngine` 包装一个 `rustls::Connection`（服务端或客户端）。
pub struct TlsEngine {
    conn: Connection,
    closed: bool,
}

impl TlsEngine {
    pub fn new(conn: impl Into<Connection>) -> Self {
        Self {
            conn: conn.into(),
            closed: false,
        }
    }

    pub fn server(config: Arc<ServerConfig>) -> Result<Self, TlsError> {
        Ok(Self::new(ServerConnection::new(config)?))
    }

    pub fn client(config: Arc<ClientConfig>, server_name: ServerName<'static>) -> Result<Self, TlsError> {
        Ok(Self::new(ClientConnection::new(config, server_name)?))
    }

    pub fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    /// 引擎内部是否有待发送的密文。
    pub fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// 协商出的应用层协议（ALPN），未协商时为 `None`。
    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        self.conn.alpn_protocol()
    }

    /// 密文 → 明文。
    ///
    /// - 交付了明文：`Ok`；
    /// - `net_in` 已耗尽而没有新明文：`BufferUnderflow`；
    /// - `app_out` 压缩后仍无空闲：`BufferOverflow`；
    /// - 对端关闭：`Closed`。
    pub fn unwrap(
        &mut self,
        net_in: &mut BufferHandle,
        app_out: &mut BufferHandle,
    ) -> Result<EngineStatus, TlsError> {
        loop {
            if self.closed {
                return Ok(EngineStatus::Closed);
            }
            if app_out.spare() == 0 {
                app_out.compact();
                if app_out.spare() == 0 {
                    return Ok(EngineStatus::BufferOverflow);
                }
            }
            match self.conn.reader().read(app_out.spare_mut()) {
                Ok(0) => {
                    self.closed = true;
                    return Ok(EngineStatus::Closed);
                }
                Ok(n) => {
                    app_out.commit(n);
                    return Ok(EngineStatus::Ok);
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {}
                Err(error) if error.kind() == io::ErrorKind::UnexpectedEof => {
                    self.closed = true;
                    return Ok(EngineStatus::Closed);
                }
                Err(error) => return Err(error.into()),
            }

            if net_in.is_empty() {
                net_in.clear();
                return Ok(EngineStatus::BufferUnderflow);
            }
            let mut ciphertext = net_in.readable();
            let consumed = self.conn.read_tls(&mut ciphertext)?;
            net_in.advance(consumed);
            self.conn.process_new_packets()?;
        }
    }

    /// 明文 → 密文：消费 `app_in` 中尽可能多的明文，并把产生的密文写入 `net_out`。
    pub fn wrap(
        &mut self,
        app_in: &mut BufferHandle,
        net_out: &mut BufferHandle,
    ) -> Result<EngineStatus, TlsError> {
        if self.closed {
            return Ok(EngineStatus::Closed);
        }
        if !app_in.is_empty() {
            let consumed = self.conn.writer().write(app_in.readable())?;
            app_in.advance(consumed);
        }
        self.drain_ciphertext(net_out)
    }

    /// 把引擎内部待发的密文（握手消息、告警、已加密记录）搬到 `net_out`。
    pub fn drain_ciphertext(&mut self, net_out: &mut BufferHandle) -> Result<EngineStatus, TlsError> {
        while self.conn.wants_write() {
            if net_out.spare() == 0 {
                net_out.compact();
                if net_out.spare() == 0 {
                    return Ok(EngineStatus::BufferOverflow);
                }
            }
            if self.conn.write_tls(&mut SpareWriter(net_out))? == 0 {
                break;
            }
        }
        Ok(EngineStatus::Ok)
    }

    /// 排入 `close_notify` 告警；随后的 `drain_ciphertext` 会将其写出。
    pub fn close(&mut self) {
        self.conn.send_close_notify();
    }
}

impl std::fmt::Debug for TlsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsEngine")
            .field("handshaking", &self.conn.is_handshaking())
            .field("closed", &self.closed)
            .finish()
    }
}

/// 把 `BufferHandle` 的空闲区当作 `io::Write` 目标。
struct SpareWriter<'a>(&'a mut BufferHandle);

impl Write for SpareWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.0.put_slice(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
