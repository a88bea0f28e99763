//! 传输配置面。
//!
//! # 教案式说明（Why）
//! - 所有可调参数在构造时显式传入，不读取进程级全局状态；
//! - 同一份结构既可由代码以 `with_*` 链式设置，也可从 TOML 文件加载，
//!   加载后统一经过 [`TransportConfig::validate`] 校验。

use std::{
    borrow::Cow,
    io,
    net::{SocketAddr, ToSocketAddrs},
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use spark_socket_buffer::ArenaConfig;
use thiserror::Error;

/// 配置加载与校验错误。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("无法读取配置文件 {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("配置解析失败: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("配置项 `{field}` 非法: {reason}")]
    Invalid {
        field: &'static str,
        reason: Cow<'static, str>,
    },
    #[error("无法解析监听地址 {addr}: {source}")]
    Address {
        addr: String,
        #[source]
        source: io::Error,
    },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<Cow<'static, str>>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// 客户端证书校验策略。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuth {
    #[default]
    None,
    Optional,
    Required,
}

/// 套接字选项；`None` 表示沿用操作系统默认值。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SocketOptions {
    pub send_buffer_size: Option<usize>,
    pub recv_buffer_size: Option<usize>,
    pub keep_alive: Option<bool>,
    pub reuse_address: Option<bool>,
    pub no_delay: Option<bool>,
}

/// TLS 密钥材料与客户端认证配置。
///
/// - `keystore_path`：PEM 文件，包含证书链与私钥；
/// - `truststore_path`：PEM 证书集合，服务端用于校验客户端证书，客户端用于校验服务端证书；
/// - 各 `*_password` 仅为兼容加密存储的配置形态，当前只接受空值或缺省。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsSettings {
    pub keystore_path: Option<PathBuf>,
    #[serde(default)]
    pub keystore_password: Option<String>,
    #[serde(default)]
    pub key_password: Option<String>,
    #[serde(default)]
    pub truststore_path: Option<PathBuf>,
    #[serde(default)]
    pub truststore_password: Option<String>,
    #[serde(default)]
    pub client_auth: ClientAuth,
}

impl TlsSettings {
    /// 服务端配置：证书链与私钥。
    pub fn server(keystore_path: impl Into<PathBuf>) -> Self {
        Self {
            keystore_path: Some(keystore_path.into()),
            keystore_password: None,
            key_password: None,
            truststore_path: None,
            truststore_password: None,
            client_auth: ClientAuth::None,
        }
    }

    /// 客户端配置：信任的根证书。
    pub fn client(truststore_path: impl Into<PathBuf>) -> Self {
        Self {
            keystore_path: None,
            keystore_password: None,
            key_password: None,
            truststore_path: Some(truststore_path.into()),
            truststore_password: None,
            client_auth: ClientAuth::None,
        }
    }

    pub fn with_truststore(mut self, path: impl Into<PathBuf>) -> Self {
        self.truststore_path = Some(path.into());
        self
    }

    pub fn with_keystore(mut self, path: impl Into<PathBuf>) -> Self {
        self.keystore_path = Some(path.into());
        self
    }

    pub fn with_client_auth(mut self, client_auth: ClientAuth) -> Self {
        self.client_auth = client_auth;
        self
    }
}

/// 竞技场参数；`page_count` 缺省时等于 `thread_num`。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ArenaSettings {
    pub page_size: usize,
    pub page_count: Option<usize>,
}

impl Default for ArenaSettings {
    fn default() -> Self {
        Self {
            page_size: 256 * 1024,
            page_count: None,
        }
    }
}

/// `TransportConfig` 汇总服务端、客户端与 UDP 多路复用器的全部参数。
///
/// # 契约说明（What）
/// - `thread_num` 至少为 2：读完成派发需要 `thread_num - 1` 个嵌套许可；
/// - `read_buffer_size`、`write_queue_capacity`、`ring_capacity` 必须大于 0；
/// - `udp_workers == 0` 时 UDP 在接收任务上同步处理消息。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    pub host: Option<String>,
    pub port: u16,
    pub read_buffer_size: usize,
    pub write_queue_capacity: usize,
    pub thread_num: usize,
    pub backlog: u32,
    pub ring_capacity: usize,
    pub ring_publish_timeout_ms: u64,
    pub udp_workers: usize,
    pub arena: ArenaSettings,
    pub socket: SocketOptions,
    pub tls: Option<TlsSettings>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        let parallelism = thread::available_parallelism().map_or(2, |n| n.get());
        Self {
            host: None,
            port: 0,
            read_buffer_size: 512,
            write_queue_capacity: 512,
            thread_num: parallelism.max(2),
            backlog: 1000,
            ring_capacity: 1024,
            ring_publish_timeout_ms: 50,
            udp_workers: parallelism,
            arena: ArenaSettings::default(),
            socket: SocketOptions::default(),
            tls: None,
        }
    }
}

impl TransportConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    /// 解析 TOML 文本并校验。
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.thread_num < 2 {
            return Err(ConfigError::invalid("thread_num", "must be >= 2"));
        }
        if self.read_buffer_size == 0 {
            return Err(ConfigError::invalid("read_buffer_size", "must be > 0"));
        }
        if self.write_queue_capacity == 0 {
            return Err(ConfigError::invalid("write_queue_capacity", "must be > 0"));
        }
        if self.ring_capacity == 0 {
            return Err(ConfigError::invalid("ring_capacity", "must be > 0"));
        }
        if self.arena.page_size == 0 {
            return Err(ConfigError::invalid("arena.page_size", "must be > 0"));
        }
        if let Some(tls) = &self.tls {
            for (field, value) in [
                ("tls.keystore_password", &tls.keystore_password),
                ("tls.key_password", &tls.key_password),
                ("tls.truststore_password", &tls.truststore_password),
            ] {
                if value.as_deref().is_some_and(|v| !v.is_empty()) {
                    return Err(ConfigError::invalid(
                        field,
                        "encrypted key material is not supported, provide unencrypted PEM",
                    ));
                }
            }
        }
        Ok(())
    }

    /// 解析监听/绑定地址；`host` 缺省时绑定全部 IPv4 地址。
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let host = self.host.as_deref().unwrap_or("0.0.0.0");
        let display = format!("{host}:{}", self.port);
        let mut candidates = (host, self.port)
            .to_socket_addrs()
            .map_err(|source| ConfigError::Address {
                addr: display.clone(),
                source,
            })?;
        candidates.next().ok_or_else(|| ConfigError::Address {
            addr: display,
            source: io::Error::new(io::ErrorKind::NotFound, "no address resolved"),
        })
    }

    pub fn arena_config(&self) -> ArenaConfig {
        ArenaConfig {
            page_size: self.arena.page_size,
            page_count: self.arena.page_count.unwrap_or(self.thread_num),
        }
    }

    pub fn ring_publish_timeout(&self) -> Duration {
        Duration::from_millis(self.ring_publish_timeout_ms)
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    pub fn with_write_queue_capacity(mut self, capacity: usize) -> Self {
        self.write_queue_capacity = capacity;
        self
    }

    pub fn with_thread_num(mut self, thread_num: usize) -> Self {
        self.thread_num = thread_num;
        self
    }

    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn with_ring_capacity(mut self, capacity: usize) -> Self {
        self.ring_capacity = capacity;
        self
    }

    pub fn with_udp_workers(mut self, workers: usize) -> Self {
        self.udp_workers = workers;
        self
    }

    pub fn with_arena(mut self, page_size: usize, page_count: usize) -> Self {
        self.arena = ArenaSettings {
            page_size,
            page_count: Some(page_count),
        };
        self
    }

    pub fn with_socket_options(mut self, options: SocketOptions) -> Self {
        self.socket = options;
        self
    }

    pub fn with_tls(mut self, tls: TlsSettings) -> Self {
        self.tls = Some(tls);
        self
    }
}
