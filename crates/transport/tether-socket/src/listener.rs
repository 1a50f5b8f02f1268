//! TCP 监听器与接入循环。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 每个监听器只持有一个可复用的接入槽位，`accept` 不为每次调用分配完成对象；
//! - 单次 `accept` 的取消必须中止挂起中的 OS 接入而不影响监听器，监听器释放则让在途
//!   `accept` 返回 `Ok(None)`，两者对调用方可区分。
//!
//! ## 逻辑（How）
//! - 平台相关的接入原语收敛在 [`AcceptSource`] 之后，接入通过 `poll_fn` 直接轮询；
//! - 取消时丢弃轮询 Future，仅撤销本次等待，监听套接字的就绪注册保持不变；
//! - 释放时先推进生命周期唤醒所有在途 `accept`，再从槽位取出监听套接字并关闭。

use std::{
    io,
    net::SocketAddr,
    task::{Context, Poll},
};

use async_trait::async_trait;
use tether_core::{
    BoxConnection, Cancellation, ConnectionError, ConnectionListener, ConnectionProperties,
    Endpoint, Lifecycle, Result, map_io_error,
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::Mutex as AsyncMutex,
};
use tracing::{debug, warn};

use crate::{
    config::SocketConfig,
    connection::SocketConnection,
    error::ACCEPT,
};

/// 平台接入原语。
pub(crate) trait AcceptSource: Send + Sync {
    fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<io::Result<(TcpStream, SocketAddr)>>;
}

impl AcceptSource for TcpListener {
    fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<io::Result<(TcpStream, SocketAddr)>> {
        TcpListener::poll_accept(self, cx)
    }
}

/// 绑定在 OS 套接字上的监听器。
pub struct SocketConnectionListener {
    endpoint: Endpoint,
    config: SocketConfig,
    slot: AsyncMutex<Option<TcpListener>>,
    lifecycle: Lifecycle,
}

impl SocketConnectionListener {
    pub(crate) fn new(source: TcpListener, local: SocketAddr, config: SocketConfig) -> Self {
        Self {
            endpoint: Endpoint::Ip(local),
            config,
            slot: AsyncMutex::new(Some(source)),
            lifecycle: Lifecycle::new(),
        }
    }

    async fn accept_stream(&self, cancel: &Cancellation) -> Result<Option<TcpStream>> {
        let guard = tokio::select! {
            biased;
            _ = self.lifecycle.closed() => return Ok(None),
            _ = cancel.cancelled() => return Err(ConnectionError::cancelled(ACCEPT)),
            guard = self.slot.lock() => guard,
        };
        let Some(source) = guard.as_ref() else {
            return Ok(None);
        };

        tokio::select! {
            biased;
            _ = self.lifecycle.closed() => Ok(None),
            _ = cancel.cancelled() => Err(ConnectionError::cancelled(ACCEPT)),
            accepted = std::future::poll_fn(|cx| AcceptSource::poll_accept(source, cx)) => match accepted {
                Ok((stream, _)) => Ok(Some(stream)),
                Err(err) => Err(map_io_error(ACCEPT, err)),
            },
        }
    }
}

#[async_trait]
impl ConnectionListener for SocketConnectionListener {
    fn local_endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn accept(
        &self,
        _options: Option<&ConnectionProperties>,
        cancel: &Cancellation,
    ) -> Result<Option<BoxConnection>> {
        if !self.lifecycle.is_active() {
            return Ok(None);
        }
        let Some(stream) = self.accept_stream(cancel).await? else {
            return Ok(None);
        };
        let connection = SocketConnection::establish(stream, &self.config, ACCEPT).inspect_err(|err| {
            warn!(endpoint = %self.endpoint, code = err.code(), "failed to configure accepted socket");
        })?;
        debug!(endpoint = %self.endpoint, "socket connection accepted");
        Ok(Some(Box::new(connection)))
    }

    async fn dispose(&self) -> Result<()> {
        self.lifecycle
            .dispose_with(|| async {
                let source = self.slot.lock().await.take();
                drop(source);
                debug!(endpoint = %self.endpoint, "socket listener disposed");
                Ok(())
            })
            .await
    }
}
