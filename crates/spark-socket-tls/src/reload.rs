use std::{fmt, sync::Arc};

use arc_swap::ArcSwap;
use rustls::ServerConfig;
use spark_socket_core::TlsSettings;

use crate::{config::server_config, error::TlsError};

/// 可热替换的 TLS 服务端配置。
///
/// # 设计动机（Why）
/// - 证书轮换不应重建监听器或打断既有连接；
/// - 读路径（每次接入取一次快照）无锁，写路径为常数时间的原子替换。
///
/// # 核心契约（What）
/// - 每个新连接在创建引擎时读取一次最新快照，已建立的连接继续持有各自的 `Arc`；
/// - [`ReloadableServerConfig::replace`] 对之后的接入立即可见，并把旧配置交还调用方；
/// - 克隆共享同一容器。
#[derive(Clone)]
pub struct ReloadableServerConfig {
    inner: Arc<ArcSwap<ServerConfig>>,
}

impl ReloadableServerConfig {
    pub fn new(initial: Arc<ServerConfig>) -> Self {
        Self {
            inner: Arc::new(ArcSwap::new(initial)),
        }
    }

    pub fn snapshot(&self) -> Arc<ServerConfig> {
        self.inner.load_full()
    }

    pub fn replace(&self, next: Arc<ServerConfig>) -> Arc<ServerConfig> {
        self.inner.swap(next)
    }

    /// 重新加载密钥材料并替换当前配置；加载失败时保留旧配置。
    pub fn reload(&self, settings: &TlsSettings) -> Result<Arc<ServerConfig>, TlsError> {
        let next = Arc::new(server_config(settings)?);
        tracing::info!(
            keystore = ?settings.keystore_path,
            "tls server configuration reloaded"
        );
        Ok(self.replace(next))
    }
}

impl fmt::Debug for ReloadableServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReloadableServerConfig")
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::PemFiles;

    #[test]
    fn reload_swaps_snapshot_and_keeps_old_on_failure() {
        let files = PemFiles::generate("reload");
        let settings = TlsSettings::server(files.keystore());
        let reloadable =
            ReloadableServerConfig::new(Arc::new(server_config(&settings).expect("初始配置")));
        let before = reloadable.snapshot();

        let previous = reloadable.reload(&settings).expect("重新加载成功");
        assert!(Arc::ptr_eq(&before, &previous));
        let current = reloadable.snapshot();
        assert!(!Arc::ptr_eq(&before, &current));

        let broken = TlsSettings::server(files.dir().join("missing.pem"));
        assert!(reloadable.reload(&broken).is_err());
        assert!(Arc::ptr_eq(&current, &reloadable.snapshot()));
    }
}
