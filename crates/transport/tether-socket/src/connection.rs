use std::{
    any::{Any, TypeId},
    io,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use socket2::{SockRef, Socket};
use tether_core::{
    Connection, ConnectionError, Endpoint, Extensions, Lifecycle, OperationKind, Result,
    SharedStream, Teardown, map_io_error,
};
use tokio::net::TcpStream;
use tracing::debug;

use crate::{
    config::SocketConfig,
    error::CONFIGURE,
    stream::SocketStream,
};

/// 原始套接字能力。
///
/// 持有连接套接字的一个复制句柄，用于检查或调整套接字选项；连接释放时一并关闭，
/// 此后访问返回 `Disposed`。
#[derive(Debug)]
pub struct SocketHandle {
    socket: Mutex<Option<Socket>>,
}

impl SocketHandle {
    fn duplicate(stream: &TcpStream) -> io::Result<Self> {
        let socket = SockRef::from(stream).try_clone()?;
        Ok(Self {
            socket: Mutex::new(Some(socket)),
        })
    }

    /// 在复制句柄上执行只读或配置操作。
    pub fn with_socket<R>(&self, f: impl FnOnce(&Socket) -> io::Result<R>) -> Result<R> {
        let guard = self.socket.lock();
        let socket = guard
            .as_ref()
            .ok_or_else(|| ConnectionError::disposed("socket handle"))?;
        f(socket).map_err(|err| map_io_error(CONFIGURE, err))
    }

    /// 当前的 `SO_LINGER` 设置。
    pub fn linger(&self) -> Result<Option<Duration>> {
        self.with_socket(Socket::linger)
    }

    pub fn is_closed(&self) -> bool {
        self.socket.lock().is_none()
    }

    fn close(&self) {
        self.socket.lock().take();
    }
}

/// TCP 连接。
pub struct SocketConnection {
    local: Endpoint,
    remote: Endpoint,
    stream: SharedStream,
    extensions: Extensions,
    lifecycle: Lifecycle,
}

impl SocketConnection {
    /// 应用连接级选项并包装已建立的流；任一步失败时流随之关闭。
    pub(crate) fn establish(
        stream: TcpStream,
        config: &SocketConfig,
        kind: OperationKind,
    ) -> Result<Self> {
        config
            .apply(&stream)
            .map_err(|err| map_io_error(CONFIGURE, err))?;
        let local = stream.local_addr().map_err(|err| map_io_error(kind, err))?;
        let remote = stream.peer_addr().map_err(|err| map_io_error(kind, err))?;
        let handle = SocketHandle::duplicate(&stream).map_err(|err| map_io_error(CONFIGURE, err))?;

        Ok(Self {
            local: Endpoint::Ip(local),
            remote: Endpoint::Ip(remote),
            stream: Arc::new(SocketStream::new(stream)),
            extensions: Extensions::new().with(handle),
            lifecycle: Lifecycle::new(),
        })
    }
}

#[async_trait]
impl Connection for SocketConnection {
    fn local_endpoint(&self) -> Option<&Endpoint> {
        Some(&self.local)
    }

    fn remote_endpoint(&self) -> Option<&Endpoint> {
        Some(&self.remote)
    }

    fn stream(&self) -> Result<&SharedStream> {
        self.lifecycle.ensure_active("socket connection")?;
        Ok(&self.stream)
    }

    fn property(&self, key: TypeId) -> Option<&(dyn Any + Send + Sync)> {
        self.extensions.get_raw(key)
    }

    async fn dispose(&self) -> Result<()> {
        self.lifecycle
            .dispose_with(|| async {
                let mut teardown = Teardown::new("socket connection");
                teardown.record(self.stream.dispose().await);
                if let Some(handle) = self.extensions.get::<SocketHandle>() {
                    handle.close();
                }
                debug!(local = %self.local, remote = %self.remote, "socket connection disposed");
                teardown.finish()
            })
            .await
    }
}
