#![deny(unsafe_code)]

//! `spark-socket-tls` 为 TCP 会话提供 TLS 通道。
//!
//! # 模块定位（Why）
//! - TLS 以装饰方式叠加在明文通道之上：[`TlsTransport`] 持有一个 `PlainTransport`，
//!   对会话呈现相同的 `StreamTransport` 能力，会话代码无需区分明文与密文；
//! - 记录层处理交给 `rustls`，本 crate 只负责缓冲管理、握手阶段的驱动与阻塞语义。
//!
//! # 模块地图（How）
//! - [`engine`]：`TlsEngine`，在竞技场缓冲之间执行 `wrap`/`unwrap`；
//! - [`gate`]：`HandshakeGate`，握手完成前的读写在条件变量上等待；
//! - [`config`]：PEM 密钥材料加载与 `rustls` 配置构造；
//! - [`reload`]：服务端配置的热替换容器；
//! - `transport`：`TlsTransport` 以及服务端/客户端通道工厂。
//!
//! # 使用方式（What）
//! ```no_run
//! use std::sync::Arc;
//! use spark_socket_core::TlsSettings;
//! use spark_socket_tls::TlsServerFactory;
//!
//! let factory = TlsServerFactory::from_settings(&TlsSettings::server("server.pem"))?;
//! // AioServer::new(config, protocol, processor).with_transport(Arc::new(factory));
//! # let _ = Arc::new(factory);
//! # Ok::<(), spark_socket_tls::TlsError>(())
//! ```

pub mod config;
pub mod engine;
mod error;
pub mod gate;
pub mod reload;
mod transport;

pub use engine::{EngineStatus, TlsEngine};
pub use error::TlsError;
pub use gate::HandshakeGate;
pub use reload::ReloadableServerConfig;
pub use transport::{TlsClientFactory, TlsServerFactory, TlsTransport};

#[cfg(test)]
pub(crate) mod testing {
    use std::{
        fs,
        path::{Path, PathBuf},
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use rustls::{ClientConfig, RootCertStore, ServerConfig};
    use rustls_pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};

    use crate::config::provider;

    pub const SERVER_NAME: &str = "localhost";

    /// 内存中的一对自签名配置：服务端证书同时作为客户端信任根。
    pub fn self_signed_pair() -> (Arc<ServerConfig>, Arc<ClientConfig>) {
        let certified = rcgen::generate_simple_self_signed(vec![SERVER_NAME.to_owned()])
            .expect("生成自签名证书");
        let cert = certified.cert.der().clone();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            certified.key_pair.serialize_der(),
        ));

        let server = ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .expect("协议版本")
            .with_no_client_auth()
            .with_single_cert(vec![cert.clone()], key)
            .expect("服务端证书");
        let mut roots = RootCertStore::empty();
        roots.add(cert).expect("信任根");
        let client = ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .expect("协议版本")
            .with_root_certificates(roots)
            .with_no_client_auth();
        (Arc::new(server), Arc::new(client))
    }

    /// 临时目录中的 PEM 文件：`keystore.pem`（证书 + 私钥）与 `cert.pem`（仅证书）。
    pub struct PemFiles {
        dir: PathBuf,
    }

    impl PemFiles {
        pub fn generate(label: &str) -> Self {
            static COUNTER: AtomicUsize = AtomicUsize::new(0);
            let dir = std::env::temp_dir().join(format!(
                "spark-socket-tls-{label}-{}-{}",
                std::process::id(),
                COUNTER.fetch_add(1, Ordering::Relaxed)
            ));
            fs::create_dir_all(&dir).expect("创建临时目录");
            let certified = rcgen::generate_simple_self_signed(vec![SERVER_NAME.to_owned()])
                .expect("生成自签名证书");
            let cert_pem = certified.cert.pem();
            let key_pem = certified.key_pair.serialize_pem();
            fs::write(dir.join("cert.pem"), &cert_pem).expect("写入证书");
            fs::write(dir.join("keystore.pem"), format!("{cert_pem}{key_pem}"))
                .expect("写入密钥库");
            Self { dir }
        }

        pub fn dir(&self) -> &Path {
            &self.dir
        }

        pub fn keystore(&self) -> PathBuf {
            self.dir.join("keystore.pem")
        }

        pub fn certificate(&self) -> PathBuf {
            self.dir.join("cert.pem")
        }
    }

    impl Drop for PemFiles {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.dir);
        }
    }
}
