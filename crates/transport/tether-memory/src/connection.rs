use std::{
    any::{Any, TypeId},
    io::{IoSlice, IoSliceMut},
    sync::Arc,
};

use async_trait::async_trait;
use tether_core::{
    Cancellation, Connection, ConnectionError, EnhancedStream, Endpoint, ErrorKind, FlushType,
    Lifecycle, OperationKind, Result, SharedStream, codes,
};
use tracing::debug;

use crate::{
    error::{self, BROKEN_PIPE},
    pipe::{Pipe, PipeError, PipeOptions},
};

/// 内存连接的字节流：读 `inbound`，写 `outbound`。
///
/// - 原生支持分散/聚集 IO 与半关闭；
/// - 写入只在背压准入阶段响应取消，返回 `Cancelled` 时对端不会看到这次写入的任何字节；
/// - 释放时完成写方向、关闭读方向，对端随后读到 EOF，向本端写入得到 `Connectivity`。
#[derive(Debug)]
pub struct MemoryStream {
    inbound: Arc<Pipe>,
    outbound: Arc<Pipe>,
    lifecycle: Lifecycle,
}

impl MemoryStream {
    fn new(inbound: Arc<Pipe>, outbound: Arc<Pipe>) -> Self {
        Self {
            inbound,
            outbound,
            lifecycle: Lifecycle::new(),
        }
    }

    fn map_error(&self, error: PipeError, kind: OperationKind) -> ConnectionError {
        if !self.lifecycle.is_active() {
            return ConnectionError::disposed("memory stream");
        }
        match error {
            PipeError::Cancelled => ConnectionError::cancelled(kind),
            PipeError::ReaderClosed => ConnectionError::new(
                ErrorKind::Connectivity,
                BROKEN_PIPE,
                format!("{}: peer closed its read side", kind.message),
            ),
            PipeError::WriterCompleted => ConnectionError::new(
                ErrorKind::InvalidState,
                codes::WRITES_SHUT_DOWN,
                format!("{}: writes have been shut down", kind.message),
            ),
        }
    }

    /// 刷新不等待背压，写入被接受后不会因取消而停在半途。
    fn apply_flush(&self, flush: FlushType) -> Result<()> {
        let result = match flush {
            FlushType::None => Ok(()),
            FlushType::FlushWrites => self.outbound.flush(),
            FlushType::FlushAndShutdownWrites => self.outbound.shutdown(),
        };
        result.map_err(|err| self.map_error(err, error::FLUSH))
    }
}

#[async_trait]
impl EnhancedStream for MemoryStream {
    fn can_shutdown_writes(&self) -> bool {
        true
    }

    fn can_scatter_gather(&self) -> bool {
        true
    }

    async fn read(&self, buf: &mut [u8], cancel: &Cancellation) -> Result<usize> {
        self.read_vectored(&mut [IoSliceMut::new(buf)], cancel).await
    }

    async fn read_vectored(
        &self,
        bufs: &mut [IoSliceMut<'_>],
        cancel: &Cancellation,
    ) -> Result<usize> {
        self.lifecycle.ensure_active("memory stream")?;
        self.inbound
            .read(bufs, cancel)
            .await
            .map_err(|err| self.map_error(err, error::READ))
    }

    async fn write(&self, buf: &[u8], flush: FlushType, cancel: &Cancellation) -> Result<()> {
        self.write_vectored(&[IoSlice::new(buf)], flush, cancel).await
    }

    async fn write_vectored(
        &self,
        bufs: &[IoSlice<'_>],
        flush: FlushType,
        cancel: &Cancellation,
    ) -> Result<()> {
        self.lifecycle.ensure_active("memory stream")?;
        self.outbound
            .write(bufs, cancel)
            .await
            .map_err(|err| self.map_error(err, error::WRITE))?;
        self.apply_flush(flush)
    }

    async fn flush(&self, flush: FlushType, cancel: &Cancellation) -> Result<()> {
        self.lifecycle.ensure_active("memory stream")?;
        cancel.check(error::FLUSH)?;
        self.apply_flush(flush)
    }

    async fn dispose(&self) -> Result<()> {
        self.lifecycle
            .dispose_with(|| async {
                self.outbound.complete();
                self.inbound.close_reader();
                Ok(())
            })
            .await
    }
}

/// 一对内存连接中的一端。
pub struct MemoryConnection {
    local: Endpoint,
    remote: Endpoint,
    stream: SharedStream,
    lifecycle: Lifecycle,
}

impl MemoryConnection {
    /// 创建直接相连的一对连接，不经过工厂与注册表。
    ///
    /// `client_options` 作用于客户端到服务端方向的管道，`server_options` 作用于反方向。
    pub fn pair(
        client_endpoint: Endpoint,
        client_options: PipeOptions,
        server_endpoint: Endpoint,
        server_options: PipeOptions,
    ) -> (MemoryConnection, MemoryConnection) {
        let to_server = Arc::new(Pipe::new(client_options));
        let to_client = Arc::new(Pipe::new(server_options));

        let client = MemoryConnection {
            local: client_endpoint.clone(),
            remote: server_endpoint.clone(),
            stream: Arc::new(MemoryStream::new(
                Arc::clone(&to_client),
                Arc::clone(&to_server),
            )),
            lifecycle: Lifecycle::new(),
        };
        let server = MemoryConnection {
            local: server_endpoint,
            remote: client_endpoint,
            stream: Arc::new(MemoryStream::new(to_server, to_client)),
            lifecycle: Lifecycle::new(),
        };
        (client, server)
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn local_endpoint(&self) -> Option<&Endpoint> {
        Some(&self.local)
    }

    fn remote_endpoint(&self) -> Option<&Endpoint> {
        Some(&self.remote)
    }

    fn stream(&self) -> Result<&SharedStream> {
        self.lifecycle.ensure_active("memory connection")?;
        Ok(&self.stream)
    }

    fn property(&self, _key: TypeId) -> Option<&(dyn Any + Send + Sync)> {
        None
    }

    async fn dispose(&self) -> Result<()> {
        self.lifecycle
            .dispose_with(|| async {
                debug!(local = %self.local, remote = %self.remote, "memory connection disposed");
                self.stream.dispose().await
            })
            .await
    }
}
