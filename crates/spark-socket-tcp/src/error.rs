use spark_socket_core::{ConfigError, TransportError};
use thiserror::Error;

/// 服务端与客户端生命周期 API 的错误。
///
/// 会话运行期间的错误不会出现在这里，它们以生命周期事件交付。
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("服务已启动，重复启动被拒绝")]
    AlreadyStarted,
    #[error("服务未启动")]
    NotStarted,
    #[error("阻塞式 API 不能在 I/O 运行时线程内调用，请改用异步版本")]
    BlockingInRuntime,
}

impl ServiceError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "spark.socket.config_invalid",
            Self::Transport(err) => err.code(),
            Self::AlreadyStarted => "spark.socket.already_started",
            Self::NotStarted => "spark.socket.not_started",
            Self::BlockingInRuntime => "spark.socket.blocking_in_runtime",
        }
    }
}
