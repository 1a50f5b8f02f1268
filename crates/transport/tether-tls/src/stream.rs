use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tether_core::{
    Cancellation, ConnectionError, EnhancedStream, ErrorKind, FlushType, Lifecycle, Result,
    WriteScope, codes, run_with_cancellation,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::Mutex as AsyncMutex,
};
use tokio_rustls::TlsStream;

use crate::{
    error::{FLUSH, READ, SHUTDOWN, WRITE, map_tls_error},
    io::StreamIo,
};

type Session = TlsStream<StreamIo>;

/// TLS 会话上的增强字节流。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 握手完成后，明文读写经由 rustls 加解密再落到被包装连接的流上；
/// - 读写两个方向分别加锁，一个读者与一个写者可以并发运行。
///
/// ## 逻辑（How）
/// - 会话经 `tokio::io::split` 拆分为读写半部，rustls 状态机由拆分内部的锁串行化；
/// - `FlushAndShutdownWrites` 先发送 `close_notify` 再半关闭底层写方向，
///   仅在底层流支持半关闭时可用；
/// - 分散/聚集 IO 由默认实现模拟：rustls 需要把明文切分为记录，原生聚集写没有收益。
///
/// ## 契约（What）
/// - 释放只丢弃 TLS 会话，不释放底层流，底层流由被包装的连接负责；
/// - 写入在会话接受首段明文之前响应取消，之后写完整个缓冲并按 `flush` 刷新。
pub struct TlsSessionStream {
    reader: AsyncMutex<Option<ReadHalf<Session>>>,
    writer: AsyncMutex<Option<WriteHalf<Session>>>,
    can_shutdown_writes: bool,
    writes_shut_down: AtomicBool,
    lifecycle: Lifecycle,
}

impl TlsSessionStream {
    pub(crate) fn new(session: Session, can_shutdown_writes: bool) -> Self {
        let (reader, writer) = tokio::io::split(session);
        Self {
            reader: AsyncMutex::new(Some(reader)),
            writer: AsyncMutex::new(Some(writer)),
            can_shutdown_writes,
            writes_shut_down: AtomicBool::new(false),
            lifecycle: Lifecycle::new(),
        }
    }

    async fn guarded<F, T>(&self, op: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.lifecycle.ensure_active("tls stream")?;
        tokio::select! {
            biased;
            _ = self.lifecycle.closed() => Err(ConnectionError::disposed("tls stream")),
            result = op => result,
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.writes_shut_down.load(Ordering::Acquire) {
            return Err(ConnectionError::new(
                ErrorKind::InvalidState,
                codes::WRITES_SHUT_DOWN,
                "tls writes have been shut down",
            ));
        }
        Ok(())
    }

    async fn write_and_flush(
        &self,
        buf: &[u8],
        flush: FlushType,
        cancel: &Cancellation,
    ) -> Result<()> {
        tether_core::ensure_shutdown_supported(self, flush)?;
        self.ensure_writable()?;
        self.guarded(async {
            let mut guard =
                run_with_cancellation(cancel, WRITE, async { Ok(self.writer.lock().await) }).await?;
            let half = guard
                .as_mut()
                .ok_or_else(|| ConnectionError::disposed("tls stream"))?;

            // 会话挂起的 `write` 没有接受任何明文；接受首段明文后不再响应取消，
            // 否则半条记录留在 rustls 缓冲中，重试会重复发送。
            let mut scope = WriteScope::new(cancel);
            if !buf.is_empty() {
                let accepted = run_with_cancellation(scope.token(), WRITE, async {
                    half.write(buf).await.map_err(|err| map_tls_error(WRITE, err))
                })
                .await?;
                scope.accepted();
                half.write_all(&buf[accepted..])
                    .await
                    .map_err(|err| map_tls_error(WRITE, err))?;
            }
            match flush {
                FlushType::None => Ok(()),
                FlushType::FlushWrites => {
                    run_with_cancellation(scope.token(), FLUSH, async {
                        half.flush().await.map_err(|err| map_tls_error(FLUSH, err))
                    })
                    .await
                }
                FlushType::FlushAndShutdownWrites => {
                    run_with_cancellation(scope.token(), SHUTDOWN, async {
                        half.shutdown()
                            .await
                            .map_err(|err| map_tls_error(SHUTDOWN, err))
                    })
                    .await?;
                    self.writes_shut_down.store(true, Ordering::Release);
                    Ok(())
                }
            }
        })
        .await
    }
}

#[async_trait]
impl EnhancedStream for TlsSessionStream {
    fn can_shutdown_writes(&self) -> bool {
        self.can_shutdown_writes
    }

    async fn read(&self, buf: &mut [u8], cancel: &Cancellation) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.guarded(run_with_cancellation(cancel, READ, async {
            let mut guard = self.reader.lock().await;
            let half = guard
                .as_mut()
                .ok_or_else(|| ConnectionError::disposed("tls stream"))?;
            half.read(buf).await.map_err(|err| map_tls_error(READ, err))
        }))
        .await
    }

    async fn write(&self, buf: &[u8], flush: FlushType, cancel: &Cancellation) -> Result<()> {
        self.write_and_flush(buf, flush, cancel).await
    }

    async fn flush(&self, flush: FlushType, cancel: &Cancellation) -> Result<()> {
        self.write_and_flush(&[], flush, cancel).await
    }

    async fn dispose(&self) -> Result<()> {
        self.lifecycle
            .dispose_with(|| async {
                let writer = self.writer.lock().await.take();
                let reader = self.reader.lock().await.take();
                drop(writer);
                drop(reader);
                Ok(())
            })
            .await
    }
}
