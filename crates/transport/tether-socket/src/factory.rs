use std::net::SocketAddr;

use async_trait::async_trait;
use socket2::Domain;
use tether_core::{
    BoxConnection, BoxListener, Cancellation, ConnectionError, ConnectionFactory,
    ConnectionProperties, Endpoint, ErrorKind, OperationKind, Result, map_io_error,
    run_with_cancellation,
};
use tokio::net::{TcpListener, TcpSocket};
use tracing::debug;

use crate::{
    config::{AddressFamily, SocketConfig},
    connection::SocketConnection,
    error::{BIND, CONNECT, UNSUPPORTED_ENDPOINT},
    listener::SocketConnectionListener,
};

/// 基于 OS 套接字的连接工厂。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 工厂只持有共享的 [`SocketConfig`]，不保存任何单连接状态；
/// - 单次调用可在能力包中放入 [`SocketConfig`] 覆盖工厂默认值。
///
/// ## 逻辑（How）
/// - `connect`：通配目标替换为同族回环地址，按配置确定地址族后以 `socket2` 创建套接字，
///   交给 Tokio 完成异步建连；套接字由 RAII 持有，任何失败分支都会先关闭再返回错误；
/// - `listen`：缺省地址时绑定 `[::]:0`（双栈），平台不支持 IPv6 时回退 `0.0.0.0:0`。
///
/// ## 契约（What）
/// - 只接受 [`Endpoint::Ip`]，其余端点返回 [`ErrorKind::Address`]；
/// - OS 失败映射为 `Connectivity`/`AddressInUse`/`Address`，并保留原生错误码。
#[derive(Clone, Debug, Default)]
pub struct SocketConnectionFactory {
    config: SocketConfig,
}

impl SocketConnectionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: SocketConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SocketConfig {
        &self.config
    }

    fn effective_config<'a>(&'a self, options: Option<&'a ConnectionProperties>) -> &'a SocketConfig {
        options
            .and_then(|options| options.try_get::<SocketConfig>())
            .unwrap_or(&self.config)
    }
}

#[async_trait]
impl ConnectionFactory for SocketConnectionFactory {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        options: Option<&ConnectionProperties>,
        cancel: &Cancellation,
    ) -> Result<BoxConnection> {
        let config = self.effective_config(options);
        let target = ip_endpoint(&endpoint.loopback_for_unspecified(), CONNECT)?;
        let (domain, target, dual_stack) = config.resolve_connect(target)?;

        let socket = config
            .open(domain, dual_stack)
            .map_err(|err| map_io_error(CONNECT, err))?;
        let socket = TcpSocket::from_std_stream(socket.into());
        let stream = run_with_cancellation(cancel, CONNECT, async {
            socket
                .connect(target)
                .await
                .map_err(|err| map_io_error(CONNECT, err))
        })
        .await?;

        let connection = SocketConnection::establish(stream, config, CONNECT)?;
        debug!(endpoint = %endpoint, "socket connection established");
        Ok(Box::new(connection))
    }

    async fn listen(
        &self,
        endpoint: Option<&Endpoint>,
        options: Option<&ConnectionProperties>,
        cancel: &Cancellation,
    ) -> Result<BoxListener> {
        cancel.check(BIND)?;
        let config = self.effective_config(options).clone();
        let listener = match endpoint {
            Some(endpoint) => {
                let addr = ip_endpoint(endpoint, BIND)?;
                let dual_stack =
                    config.family == AddressFamily::Unspecified && addr.ip().is_unspecified();
                bind(&config, addr, dual_stack)?
            }
            None => {
                let (wildcard, dual_stack) = config.wildcard();
                match bind(&config, wildcard, dual_stack) {
                    Ok(listener) => listener,
                    Err(err) if dual_stack => {
                        debug!(code = err.code(), "dual-stack bind unavailable; falling back to IPv4");
                        let (v4, _) = config.clone().with_family(AddressFamily::V4).wildcard();
                        bind(&config, v4, false)?
                    }
                    Err(err) => return Err(err),
                }
            }
        };

        let local = listener
            .local_addr()
            .map_err(|err| map_io_error(BIND, err))?;
        debug!(endpoint = %local, backlog = config.backlog, "socket listener bound");
        Ok(Box::new(SocketConnectionListener::new(listener, local, config)))
    }
}

fn bind(config: &SocketConfig, addr: SocketAddr, dual_stack: bool) -> Result<TcpListener> {
    let socket = config
        .open(Domain::for_address(addr), dual_stack)
        .map_err(|err| map_io_error(BIND, err))?;
    #[cfg(unix)]
    socket
        .set_reuse_address(true)
        .map_err(|err| map_io_error(BIND, err))?;
    socket
        .bind(&addr.into())
        .map_err(|err| map_io_error(BIND, err))?;
    socket
        .listen(config.backlog)
        .map_err(|err| map_io_error(BIND, err))?;
    TcpListener::from_std(socket.into()).map_err(|err| map_io_error(BIND, err))
}

fn ip_endpoint(endpoint: &Endpoint, kind: OperationKind) -> Result<SocketAddr> {
    endpoint.as_socket_addr().ok_or_else(|| {
        ConnectionError::new(
            ErrorKind::Address,
            UNSUPPORTED_ENDPOINT,
            format!("{}: {endpoint} is not an IP endpoint", kind.message),
        )
    })
}
