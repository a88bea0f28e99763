//! 从 [`TlsSettings`] 构造 `rustls` 服务端/客户端配置。
//!
//! # 教案式说明
//! - **Why**：密钥材料只接受 PEM；把加载与校验集中在一处，配置错误在启动阶段暴露，
//!   而不是在第一次握手时；
//! - **How**：`rustls-pki-types` 的 `PemObject` 解析证书链与私钥，
//!   客户端认证经 `WebPkiClientVerifier` 落地；
//! - **What**：加密的密钥库（非空口令）以 [`TlsError::EncryptedKeystore`] 拒绝。

use std::{path::Path, sync::Arc};

use rustls::{
    ClientConfig, RootCertStore, ServerConfig, crypto::CryptoProvider,
    server::WebPkiClientVerifier,
};
use rustls_pki_types::{
    CertificateDer, PrivateKeyDer,
    pem::{self, PemObject},
};
use spark_socket_core::{ClientAuth, TlsSettings};

use crate::error::TlsError;

/// 本 crate 使用的密码学实现。
pub fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

pub fn server_config(settings: &TlsSettings) -> Result<ServerConfig, TlsError> {
    reject_encrypted(settings)?;
    let keystore = settings
        .keystore_path
        .as_deref()
        .ok_or(TlsError::Missing("keystore_path"))?;
    let certs = load_certificates(keystore)?;
    let key = load_private_key(keystore)?;

    let builder =
        ServerConfig::builder_with_provider(provider()).with_safe_default_protocol_versions()?;
    let builder = match settings.client_auth {
        ClientAuth::None => builder.with_no_client_auth(),
        mode => {
            let truststore = settings
                .truststore_path
                .as_deref()
                .ok_or(TlsError::Missing("truststore_path"))?;
            let roots = Arc::new(load_roots(truststore)?);
            let verifier = WebPkiClientVerifier::builder_with_provider(roots, provider());
            let verifier = if mode == ClientAuth::Optional {
                verifier.allow_unauthenticated().build()?
            } else {
                verifier.build()?
            };
            builder.with_client_cert_verifier(verifier)
        }
    };
    Ok(builder.with_single_cert(certs, key)?)
}

pub fn client_config(settings: &TlsSettings) -> Result<ClientConfig, TlsError> {
    reject_encrypted(settings)?;
    let truststore = settings
        .truststore_path
        .as_deref()
        .ok_or(TlsError::Missing("truststore_path"))?;
    let builder = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(load_roots(truststore)?);
    match settings.keystore_path.as_deref() {
        Some(keystore) => Ok(builder
            .with_client_auth_cert(load_certificates(keystore)?, load_private_key(keystore)?)?),
        None => Ok(builder.with_no_client_auth()),
    }
}

pub fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = CertificateDer::pem_file_iter(path)
        .map_err(|source| pem_error(path, source))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| pem_error(path, source))?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates {
            path: path.to_path_buf(),
        });
    }
    Ok(certs)
}

pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    PrivateKeyDer::from_pem_file(path).map_err(|source| match source {
        pem::Error::NoItemsFound => TlsError::NoPrivateKey {
            path: path.to_path_buf(),
        },
        source => pem_error(path, source),
    })
}

pub fn load_roots(path: &Path) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certificates(path)? {
        roots.add(cert)?;
    }
    Ok(roots)
}

fn reject_encrypted(settings: &TlsSettings) -> Result<(), TlsError> {
    let passwords = [
        ("keystore_password", &settings.keystore_password),
        ("key_password", &settings.key_password),
        ("truststore_password", &settings.truststore_password),
    ];
    for (field, value) in passwords {
        if value.as_deref().is_some_and(|password| !password.is_empty()) {
            return Err(TlsError::EncryptedKeystore(field));
        }
    }
    Ok(())
}

fn pem_error(path: &Path, source: pem::Error) -> TlsError {
    TlsError::Pem {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::PemFiles;

    #[test]
    fn server_and_client_configs_load_from_pem() {
        let files = PemFiles::generate("config-load");
        let server = server_config(&TlsSettings::server(files.keystore()))
            .expect("服务端配置应能构造");
        assert!(server.alpn_protocols.is_empty());
        client_config(&TlsSettings::client(files.certificate())).expect("客户端配置应能构造");
    }

    #[test]
    fn passwords_mean_encrypted_keystore() {
        let files = PemFiles::generate("config-password");
        let mut settings = TlsSettings::server(files.keystore());
        settings.key_password = Some("secret".to_owned());
        let error = server_config(&settings).expect_err("加密私钥不受支持");
        assert!(matches!(error, TlsError::EncryptedKeystore("key_password")));
    }

    #[test]
    fn client_auth_requires_truststore() {
        let files = PemFiles::generate("config-client-auth");
        let settings =
            TlsSettings::server(files.keystore()).with_client_auth(ClientAuth::Required);
        let error = server_config(&settings).expect_err("缺少信任库");
        assert!(matches!(error, TlsError::Missing("truststore_path")));

        let settings = settings.with_truststore(files.certificate());
        server_config(&settings).expect("带信任库的双向认证配置应能构造");
    }

    #[test]
    fn certificate_file_without_key_is_rejected() {
        let files = PemFiles::generate("config-no-key");
        let error = load_private_key(&files.certificate()).expect_err("证书文件中没有私钥");
        assert!(matches!(error, TlsError::NoPrivateKey { .. }));
        assert_eq!(error.code(), "spark.socket.tls.key_material");
    }
}
