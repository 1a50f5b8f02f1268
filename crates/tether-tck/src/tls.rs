//! 测试用的自签名 PKI。
//!
//! # 设计动机（Why）
//! - 测试环境无法依赖外部分发的证书，因此需动态构造简易 PKI；
//! - rustls 的进程级加密提供者只能安装一次，所有构造函数都先调用 [`ensure_crypto_provider`]。

use std::sync::{Arc, Once};

use anyhow::{Context, anyhow};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls::{
    ClientConfig, RootCertStore, ServerConfig,
    pki_types::{CertificateDer, PrivateKeyDer},
};

/// 安装进程级默认加密提供者（AWS-LC）。重复调用无副作用。
pub fn ensure_crypto_provider() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        // 其他测试可能已安装提供者，此时保留既有安装。
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });
}

/// 自签名的服务端身份。
pub struct SelfSignedIdentity {
    /// 可直接用于握手的服务端配置。
    pub server_config: Arc<ServerConfig>,
    /// 证书 DER，供客户端信任。
    pub certificate: Vec<u8>,
}

impl SelfSignedIdentity {
    /// 以 `common_name` 作为 CN 与 SAN 签发证书。
    pub fn generate(common_name: &str) -> anyhow::Result<Self> {
        ensure_crypto_provider();

        let mut params =
            CertificateParams::new(vec![common_name.to_string()]).context("构造证书参数失败")?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;

        let key_pair = KeyPair::generate().context("生成证书私钥失败")?;
        let certificate = params
            .self_signed(&key_pair)
            .context("签发自签名证书失败")?;
        let cert_der = certificate.der().to_vec();
        let key_der = key_pair.serialize_der();

        let private_key = PrivateKeyDer::try_from(key_der)
            .map_err(|err| anyhow!("解析私钥失败: {err}"))?;
        let server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![CertificateDer::from(cert_der.clone())], private_key)
            .context("构建服务端 TLS 配置失败")?;

        Ok(Self {
            server_config: Arc::new(server_config),
            certificate: cert_der,
        })
    }

    /// 仅信任本身份证书的客户端配置。
    pub fn client_config(&self) -> anyhow::Result<Arc<ClientConfig>> {
        client_config_trusting(&self.certificate)
    }
}

/// 构造仅信任指定证书的客户端配置。
pub fn client_config_trusting(certificate: &[u8]) -> anyhow::Result<Arc<ClientConfig>> {
    ensure_crypto_provider();
    let mut roots = RootCertStore::empty();
    roots
        .add(CertificateDer::from(certificate.to_vec()))
        .context("将证书写入 Root Store 失败")?;

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}
