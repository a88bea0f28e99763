use std::{borrow::Cow, io};

use thiserror::Error;

/// 业务与协议扩展点返回的通用错误类型。
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub const BIND: OperationKind = OperationKind {
    code: "spark.socket.bind_failed",
    message: "socket bind",
};
pub const ACCEPT: OperationKind = OperationKind {
    code: "spark.socket.accept_failed",
    message: "tcp accept",
};
pub const CONNECT: OperationKind = OperationKind {
    code: "spark.socket.connect_failed",
    message: "tcp connect",
};
pub const READ: OperationKind = OperationKind {
    code: "spark.socket.read_failed",
    message: "channel read",
};
pub const WRITE: OperationKind = OperationKind {
    code: "spark.socket.write_failed",
    message: "channel write",
};
pub const CONFIGURE: OperationKind = OperationKind {
    code: "spark.socket.configure_failed",
    message: "socket configure",
};
pub const SHUTDOWN: OperationKind = OperationKind {
    code: "spark.socket.shutdown_failed",
    message: "channel shutdown",
};
pub const RECV_FROM: OperationKind = OperationKind {
    code: "spark.socket.udp.recv_failed",
    message: "udp recv_from",
};
pub const SEND_TO: OperationKind = OperationKind {
    code: "spark.socket.udp.send_failed",
    message: "udp send_to",
};
pub const RUNTIME: OperationKind = OperationKind {
    code: "spark.socket.runtime_failed",
    message: "io runtime",
};

/// 会话生命周期事件携带的错误分类。
///
/// # 契约说明（What）
/// - 除 `Process` 外所有变体对会话都是致命的：事件派发后会话随即关闭；
/// - [`TransportError::code`] 返回稳定错误码，日志与告警规则应基于错误码而非文案匹配。
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("解码失败: {0}")]
    Decode(#[from] DecodeError),
    #[error("业务处理失败: {0}")]
    Process(#[source] BoxError),
    #[error("{}: {}", .op.message, .source)]
    Io {
        op: OperationKind,
        #[source]
        source: io::Error,
    },
    #[error("读缓冲已满（容量 {capacity} 字节）但仍无可解码消息")]
    BufferOverflow { capacity: usize },
    #[error("TLS 缓冲扩容超过引擎上限 {limit} 字节")]
    EngineOverflow { limit: usize },
    #[error("TLS 握手失败: {0}")]
    Handshake(#[source] BoxError),
    #[error("会话已关闭")]
    Closed,
}

impl TransportError {
    pub fn io(op: OperationKind, source: io::Error) -> Self {
        Self::Io { op, source }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Decode(_) => "spark.socket.decode_failed",
            Self::Process(_) => "spark.socket.process_failed",
            Self::Io { op, .. } => op.code,
            Self::BufferOverflow { .. } => "spark.socket.read_buffer_overflow",
            Self::EngineOverflow { .. } => "spark.socket.tls.engine_overflow",
            Self::Handshake(_) => "spark.socket.tls.handshake_failed",
            Self::Closed => "spark.socket.closed",
        }
    }

    /// 是否终止会话。
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Process(_))
    }
}

/// `Session::write` 被拒绝的原因；背压是信号而不是故障。
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum WriteRejected {
    #[error("写队列已满，请稍后重试")]
    Backpressure,
    #[error("会话已关闭，拒绝写入")]
    Closed,
}

impl WriteRejected {
    pub fn code(self) -> &'static str {
        match self {
            Self::Backpressure => "spark.socket.write_backpressure",
            Self::Closed => "spark.socket.write_closed",
        }
    }
}

/// `Protocol::decode` 的失败分类；任一失败都会以 `DecodeException` 事件关闭会话。
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("帧长度 {length} 超过上限 {limit}")]
    FrameTooLarge { length: usize, limit: usize },
    #[error("报文格式错误: {0}")]
    Malformed(Cow<'static, str>),
    #[error("{0}")]
    Other(#[from] BoxError),
}

impl DecodeError {
    pub fn malformed(reason: impl Into<Cow<'static, str>>) -> Self {
        Self::Malformed(reason.into())
    }
}

/// `Protocol::encode` 的失败分类。
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("消息无法编码: {0}")]
    Invalid(Cow<'static, str>),
    #[error("{0}")]
    Other(#[from] BoxError),
}

/// [`write_message`](crate::protocol::write_message) 的失败分类。
#[derive(Debug, Error)]
pub enum SendError {
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Rejected(#[from] WriteRejected),
}
