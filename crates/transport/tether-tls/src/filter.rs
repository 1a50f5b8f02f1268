use std::{any::Any, future::Future, io, sync::Arc};

use async_trait::async_trait;
use tether_core::{
    BoxConnection, BoxFactory, Cancellation, ConnectionError, ConnectionFilter,
    ConnectionProperties, Endpoint, Extensions, FilteringConnection, FilteringConnectionFactory,
    Result, SharedStream, run_with_cancellation,
};
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};
use tracing::{debug, warn};

use crate::{
    error::{HANDSHAKE, map_tls_error},
    io::StreamIo,
    options::{TlsClientOptions, TlsServerOptions},
    session::{TlsSessionInfo, TlsSide, server_name_text},
    stream::TlsSessionStream,
};

/// 在任意基础工厂之上叠加 TLS 的工厂。
pub type TlsConnectionFactory = FilteringConnectionFactory<TlsFilter>;

/// 以 TLS 装饰 `base` 产生的每条连接。
pub fn tls_factory(base: BoxFactory) -> TlsConnectionFactory {
    FilteringConnectionFactory::new(base, TlsFilter)
}

/// TLS 装饰器。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - TLS 只依赖被包装连接的字节流，内存管道与 OS 套接字上的行为一致；
/// - 必需配置缺失属于调用方错误，必须在建立基础连接之前暴露，不产生半建立的连接。
///
/// ## 逻辑（How）
/// - `prepare_connect`/`prepare_listen` 从能力包读取 [`TlsClientOptions`]/[`TlsServerOptions`]；
/// - 握手在基础连接的流上执行，完成后以 [`TlsSessionStream`] 覆盖流，
///   并把 [`TlsSessionInfo`] 发布为连接能力；
/// - 服务端每次握手读取热更新容器的当前快照。
///
/// ## 契约（What）
/// - 握手失败（含取消）时，已创建的 TLS 会话随握手 Future 丢弃，基础连接恰好释放一次，
///   随后返回握手错误；
/// - 底层传输失败保持原有分类，证书与协议错误归为 `Handshake`。
#[derive(Clone, Copy, Debug, Default)]
pub struct TlsFilter;

#[async_trait]
impl ConnectionFilter for TlsFilter {
    type ConnectState = TlsClientOptions;
    type ListenState = TlsServerOptions;

    fn name(&self) -> &'static str {
        "tls"
    }

    fn prepare_connect(
        &self,
        _endpoint: &Endpoint,
        options: Option<&ConnectionProperties>,
    ) -> Result<TlsClientOptions> {
        required::<TlsClientOptions>(options).cloned()
    }

    fn prepare_listen(&self, options: Option<&ConnectionProperties>) -> Result<TlsServerOptions> {
        required::<TlsServerOptions>(options).cloned()
    }

    async fn on_connect(
        &self,
        state: TlsClientOptions,
        base: BoxConnection,
        cancel: &Cancellation,
    ) -> Result<BoxConnection> {
        let connector = TlsConnector::from(state.config().clone());
        let server_name = state.server_name().clone();
        let sni = server_name_text(&server_name);
        establish(base, cancel, move |transport| async move {
            let session = connector.connect(server_name, transport).await?;
            let info = TlsSessionInfo::capture(TlsSide::Client, session.get_ref().1, sni);
            Ok::<_, io::Error>((TlsStream::from(session), info))
        })
        .await
    }

    async fn on_accept(
        &self,
        state: &TlsServerOptions,
        base: BoxConnection,
        cancel: &Cancellation,
    ) -> Result<BoxConnection> {
        let acceptor = TlsAcceptor::from(state.config().snapshot());
        establish(base, cancel, move |transport| async move {
            let session = acceptor.accept(transport).await?;
            let connection = session.get_ref().1;
            let sni = connection.server_name().map(str::to_owned);
            let info = TlsSessionInfo::capture(TlsSide::Server, connection, sni);
            Ok::<_, io::Error>((TlsStream::from(session), info))
        })
        .await
    }
}

fn required<T>(options: Option<&ConnectionProperties>) -> Result<&T>
where
    T: Any + Send + Sync,
{
    match options {
        Some(options) => options.get::<T>(),
        None => Err(ConnectionError::missing_property::<T>()),
    }
}

/// 在基础连接的流上完成握手并组装装饰后的连接。
async fn establish<H, Fut>(
    base: BoxConnection,
    cancel: &Cancellation,
    handshake: H,
) -> Result<BoxConnection>
where
    H: FnOnce(StreamIo) -> Fut,
    Fut: Future<Output = io::Result<(TlsStream<StreamIo>, TlsSessionInfo)>>,
{
    let stream = match base.stream() {
        Ok(stream) => SharedStream::clone(stream),
        Err(err) => return Err(release_base(base, err).await),
    };
    let can_shutdown_writes = stream.can_shutdown_writes();
    let io = StreamIo::new(stream);

    let outcome = run_with_cancellation(cancel, HANDSHAKE, async {
        handshake(io)
            .await
            .map_err(|err| map_tls_error(HANDSHAKE, err))
    })
    .await;

    match outcome {
        Ok((session, info)) => {
            debug!(
                side = ?info.side(),
                version = ?info.protocol_version(),
                remote = ?base.remote_endpoint(),
                "tls handshake completed"
            );
            let stream = TlsSessionStream::new(session, can_shutdown_writes);
            Ok(Box::new(
                FilteringConnection::new(base)
                    .with_stream(Arc::new(stream))
                    .with_extensions(Extensions::new().with(info)),
            ))
        }
        Err(err) => {
            warn!(
                code = err.code(),
                kind = %err.kind(),
                remote = ?base.remote_endpoint(),
                "tls handshake failed"
            );
            Err(release_base(base, err).await)
        }
    }
}

async fn release_base(base: BoxConnection, err: ConnectionError) -> ConnectionError {
    if let Err(dispose_err) = base.dispose().await {
        warn!(code = dispose_err.code(), "failed to dispose base connection after tls failure");
    }
    err
}
