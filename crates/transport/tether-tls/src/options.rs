//! TLS 装饰器通过能力包读取的配置。

use std::{fmt, sync::Arc};

use arc_swap::ArcSwap;
use rustls::{ClientConfig, ServerConfig};
use rustls_pki_types::ServerName;
use tether_core::{ConnectionError, ErrorKind, Result};

use crate::error::INVALID_SERVER_NAME;

/// 出站连接的 TLS 参数。
///
/// 放入 `connect` 的能力包；缺失时工厂在建立基础连接之前即返回 `Configuration` 错误。
#[derive(Clone)]
pub struct TlsClientOptions {
    config: Arc<ClientConfig>,
    server_name: ServerName<'static>,
}

impl TlsClientOptions {
    pub fn new(config: Arc<ClientConfig>, server_name: ServerName<'static>) -> Self {
        Self {
            config,
            server_name,
        }
    }

    /// 以主机名或 IP 文本构造，名称非法时返回 `Configuration` 错误。
    pub fn for_host(config: Arc<ClientConfig>, host: &str) -> Result<Self> {
        let server_name = ServerName::try_from(host.to_owned()).map_err(|err| {
            ConnectionError::new(
                ErrorKind::Configuration,
                INVALID_SERVER_NAME,
                format!("invalid tls server name {host:?}"),
            )
            .with_source(err)
        })?;
        Ok(Self::new(config, server_name))
    }

    pub fn config(&self) -> &Arc<ClientConfig> {
        &self.config
    }

    pub fn server_name(&self) -> &ServerName<'static> {
        &self.server_name
    }
}

impl fmt::Debug for TlsClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsClientOptions")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

/// 支持热更新的服务端配置容器。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 证书轮换时无需重建监听器：监听器持有容器的克隆，每次握手读取当前快照；
/// - 已建立的会话继续使用握手时的配置，替换只影响后续握手。
///
/// ## 逻辑（How）
/// - 内部为 `Arc<ArcSwap<ServerConfig>>`，读路径无锁，写路径原子替换；
/// - 克隆共享同一存储，任一克隆上的替换对所有持有者可见。
#[derive(Clone)]
pub struct HotReloadingServerConfig {
    inner: Arc<ArcSwap<ServerConfig>>,
}

impl HotReloadingServerConfig {
    pub fn new(initial: Arc<ServerConfig>) -> Self {
        Self {
            inner: Arc::new(ArcSwap::new(initial)),
        }
    }

    #[inline]
    pub fn from_config(initial: ServerConfig) -> Self {
        Self::new(Arc::new(initial))
    }

    /// 当前配置的共享快照。
    pub fn snapshot(&self) -> Arc<ServerConfig> {
        self.inner.load_full()
    }

    /// 原子替换配置，返回旧配置。
    pub fn replace(&self, next: Arc<ServerConfig>) -> Arc<ServerConfig> {
        self.inner.swap(next)
    }
}

impl fmt::Debug for HotReloadingServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HotReloadingServerConfig").finish_non_exhaustive()
    }
}

/// 监听器的 TLS 参数，放入 `listen` 的能力包。
#[derive(Clone, Debug)]
pub struct TlsServerOptions {
    config: HotReloadingServerConfig,
}

impl TlsServerOptions {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self::hot_reloading(HotReloadingServerConfig::new(config))
    }

    pub fn hot_reloading(config: HotReloadingServerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HotReloadingServerConfig {
        &self.config
    }
}
