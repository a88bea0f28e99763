use std::{io, path::PathBuf};

use rustls_pki_types::{InvalidDnsNameError, pem};
use thiserror::Error;

/// TLS 密钥材料加载、配置构造与记录层处理的错误。
///
/// # 契约（What）
/// - 配置阶段的变体（`Pem`、`Missing` 等）在构造工厂时返回，不会出现在会话运行期间；
/// - 运行期变体（`Rustls`、`Overflow`、`Io`）由通道转换为 I/O 错误或握手错误，
///   最终以生命周期事件交付；
/// - [`TlsError::code`] 提供稳定错误码，便于日志聚合。
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("无法解析 PEM 文件 {path}: {source}")]
    Pem {
        path: PathBuf,
        #[source]
        source: pem::Error,
    },
    #[error("{path} 中没有证书")]
    NoCertificates { path: PathBuf },
    #[error("{path} 中没有私钥")]
    NoPrivateKey { path: PathBuf },
    #[error("TLS 配置缺少 `{0}`")]
    Missing(&'static str),
    #[error("不支持加密的密钥库：`{0}` 必须为空")]
    EncryptedKeystore(&'static str),
    #[error("服务端名称非法: {0}")]
    ServerName(#[from] InvalidDnsNameError),
    #[error("客户端证书校验器构造失败: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),
    #[error(transparent)]
    Rustls(#[from] rustls::Error),
    #[error("TLS 引擎缓冲超过上限 {limit} 字节")]
    Overflow { limit: usize },
    #[error("TLS 记录层 I/O 失败: {0}")]
    Io(#[from] io::Error),
}

impl TlsError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Pem { .. } | Self::NoCertificates { .. } | Self::NoPrivateKey { .. } => {
                "spark.socket.tls.key_material"
            }
            Self::Missing(_) | Self::EncryptedKeystore(_) | Self::ServerName(_) => {
                "spark.socket.tls.config_invalid"
            }
            Self::Verifier(_) => "spark.socket.tls.verifier",
            Self::Rustls(_) => "spark.socket.tls.protocol",
            Self::Overflow { .. } => "spark.socket.tls.engine_overflow",
            Self::Io(_) => "spark.socket.tls.io",
        }
    }

    /// 转换为通道读写接口使用的 `io::Error`。
    pub(crate) fn into_io(self) -> io::Error {
        match self {
            Self::Io(error) => error,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
