//! 写合并装饰器。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 逐帧写入小块数据的协议会产生大量底层调用；在固定容量的缓冲中累积写入，
//!   直到缓冲放不下或调用方显式刷新时才转交底层流；
//! - 读方向原样委托，不引入额外拷贝。
//!
//! ## 逻辑（How）
//! - 放得下且不要求刷新：追加到缓冲后立即返回；
//! - 缓冲为空：调用方缓冲直接写出，不做拷贝；
//! - 底层支持聚集写：以 `[缓冲, 调用方缓冲]` 一次写出；
//! - 否则填满缓冲写出，剩余部分小于容量且不要求刷新时留在缓冲中，
//!   其余情况依次写出两段。
//!
//! ## 契约（What）
//! - 刷新类型只附加在最后一次底层写入上；
//! - 返回 `Cancelled` 的写入既没有进入缓冲也没有到达底层流；底层流接受首个字节后，
//!   本次写入改用内部令牌写完，缓冲随之清空或切分，不会再次写出已被接受的字节；
//! - 释放时以 [`FlushType::FlushWrites`] 推送残留字节，但不释放底层流。

use std::{
    io::{IoSlice, IoSliceMut},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use bytes::BytesMut;
use tether_core::{
    BoxConnection, Cancellation, ConnectionError, ConnectionFilter, ConnectionProperties,
    EnhancedStream, Endpoint, ErrorKind, FlushType, Lifecycle, OperationKind, Result,
    SharedStream, Teardown, WriteScope, codes, ensure_shutdown_supported, run_with_cancellation,
};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};
use tracing::debug;

use crate::{
    decorate,
    error::{FLUSH, INVALID_CAPACITY, WRITE},
};

/// 在底层流之上合并小块写入的流。
pub struct WriteBufferingStream {
    base: SharedStream,
    capacity: usize,
    pending: AsyncMutex<BytesMut>,
    writes_shut_down: AtomicBool,
    lifecycle: Lifecycle,
}

impl WriteBufferingStream {
    /// `capacity` 必须为正数。
    pub fn new(base: SharedStream, capacity: usize) -> Result<Self> {
        validate_capacity(capacity)?;
        Ok(Self {
            base,
            capacity,
            pending: AsyncMutex::new(BytesMut::with_capacity(capacity)),
            writes_shut_down: AtomicBool::new(false),
            lifecycle: Lifecycle::new(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 当前缓冲中尚未写出的字节数。
    pub async fn buffered(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// 释放会中断进行中的操作；取消只在持锁之前与底层流接受首个字节之前生效。
    async fn guarded<F, T>(&self, op: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.lifecycle.ensure_active("write buffering stream")?;
        tokio::select! {
            biased;
            _ = self.lifecycle.closed() => Err(ConnectionError::disposed("write buffering stream")),
            result = op => result,
        }
    }

    async fn lock_pending(
        &self,
        cancel: &Cancellation,
        kind: OperationKind,
    ) -> Result<MutexGuard<'_, BytesMut>> {
        run_with_cancellation(cancel, kind, async { Ok(self.pending.lock().await) }).await
    }

    fn ensure_writable(&self, flush: FlushType) -> Result<()> {
        ensure_shutdown_supported(self, flush)?;
        if self.writes_shut_down.load(Ordering::Acquire) {
            return Err(ConnectionError::new(
                ErrorKind::InvalidState,
                codes::WRITES_SHUT_DOWN,
                "buffered writes have been shut down",
            ));
        }
        Ok(())
    }

    fn mark_flushed(&self, flush: FlushType) {
        if flush.shuts_down_writes() {
            self.writes_shut_down.store(true, Ordering::Release);
        }
    }

    /// 失败时 `pending` 恢复到调用前的内容，返回 `Cancelled` 的写入不会留下任何字节。
    async fn write_locked(
        &self,
        pending: &mut BytesMut,
        buf: &[u8],
        flush: FlushType,
        scope: &mut WriteScope<'_>,
    ) -> Result<()> {
        let room = self.capacity - pending.len();
        if buf.len() <= room && flush == FlushType::None {
            pending.extend_from_slice(buf);
            return Ok(());
        }

        if pending.is_empty() {
            return self.base.write(buf, flush, scope.token()).await;
        }

        if self.base.can_scatter_gather() {
            self.base
                .write_vectored(
                    &[IoSlice::new(pending), IoSlice::new(buf)],
                    flush,
                    scope.token(),
                )
                .await?;
            pending.clear();
            return Ok(());
        }

        let mark = pending.len();
        if buf.len() <= room {
            pending.extend_from_slice(buf);
            if let Err(err) = self.base.write(pending, flush, scope.token()).await {
                pending.truncate(mark);
                return Err(err);
            }
            pending.clear();
            return Ok(());
        }

        if buf.len() - room < self.capacity && flush == FlushType::None {
            // 两次 IO 不可避免，第二次留到以后：填满缓冲写出，余下部分留在缓冲中。
            pending.extend_from_slice(&buf[..room]);
            if let Err(err) = self.base.write(pending, FlushType::None, scope.token()).await {
                pending.truncate(mark);
                return Err(err);
            }
            pending.clear();
            pending.extend_from_slice(&buf[room..]);
            return Ok(());
        }

        self.base.write(pending, FlushType::None, scope.token()).await?;
        scope.accepted();
        pending.clear();
        self.base.write(buf, flush, scope.token()).await
    }

    async fn flush_locked(
        &self,
        pending: &mut BytesMut,
        flush: FlushType,
        cancel: &Cancellation,
    ) -> Result<()> {
        if pending.is_empty() {
            return self.base.flush(flush, cancel).await;
        }
        self.base.write(pending, flush, cancel).await?;
        pending.clear();
        Ok(())
    }
}

#[async_trait]
impl EnhancedStream for WriteBufferingStream {
    fn can_shutdown_writes(&self) -> bool {
        self.base.can_shutdown_writes()
    }

    fn can_scatter_gather(&self) -> bool {
        true
    }

    async fn read(&self, buf: &mut [u8], cancel: &Cancellation) -> Result<usize> {
        self.lifecycle.ensure_active("write buffering stream")?;
        self.base.read(buf, cancel).await
    }

    async fn read_vectored(
        &self,
        bufs: &mut [IoSliceMut<'_>],
        cancel: &Cancellation,
    ) -> Result<usize> {
        self.lifecycle.ensure_active("write buffering stream")?;
        self.base.read_vectored(bufs, cancel).await
    }

    async fn write(&self, buf: &[u8], flush: FlushType, cancel: &Cancellation) -> Result<()> {
        self.ensure_writable(flush)?;
        self.guarded(async {
            let mut pending = self.lock_pending(cancel, WRITE).await?;
            let mut scope = WriteScope::new(cancel);
            self.write_locked(&mut pending, buf, flush, &mut scope).await?;
            self.mark_flushed(flush);
            Ok(())
        })
        .await
    }

    async fn write_vectored(
        &self,
        bufs: &[IoSlice<'_>],
        flush: FlushType,
        cancel: &Cancellation,
    ) -> Result<()> {
        self.ensure_writable(flush)?;
        self.guarded(async {
            let mut pending = self.lock_pending(cancel, WRITE).await?;
            let total: usize = bufs.iter().map(|buf| buf.len()).sum();

            if total <= self.capacity - pending.len() && flush == FlushType::None {
                for buf in bufs {
                    pending.extend_from_slice(buf);
                }
            } else if self.base.can_scatter_gather() {
                let mut gathered = Vec::with_capacity(bufs.len() + 1);
                if !pending.is_empty() {
                    gathered.push(IoSlice::new(&pending));
                }
                gathered.extend(bufs.iter().map(|buf| IoSlice::new(buf)));
                self.base.write_vectored(&gathered, flush, cancel).await?;
                drop(gathered);
                pending.clear();
            } else {
                let mut joined = BytesMut::with_capacity(total);
                for buf in bufs {
                    joined.extend_from_slice(buf);
                }
                let mut scope = WriteScope::new(cancel);
                self.write_locked(&mut pending, &joined, flush, &mut scope)
                    .await?;
            }

            self.mark_flushed(flush);
            Ok(())
        })
        .await
    }

    async fn flush(&self, flush: FlushType, cancel: &Cancellation) -> Result<()> {
        self.ensure_writable(flush)?;
        self.guarded(async {
            let mut pending = self.lock_pending(cancel, FLUSH).await?;
            self.flush_locked(&mut pending, flush, cancel).await?;
            self.mark_flushed(flush);
            Ok(())
        })
        .await
    }

    async fn dispose(&self) -> Result<()> {
        self.lifecycle
            .dispose_with(|| async {
                let mut teardown = Teardown::new("write buffering stream");
                let mut pending = self.pending.lock().await;
                if !pending.is_empty() && !self.writes_shut_down.load(Ordering::Acquire) {
                    debug!(bytes = pending.len(), "flushing buffered writes on dispose");
                    teardown.record(
                        self.base
                            .write(&pending, FlushType::FlushWrites, &Cancellation::new())
                            .await,
                    );
                }
                pending.clear();
                teardown.finish()
            })
            .await
    }
}

/// 为每条连接叠加 [`WriteBufferingStream`] 的装饰器。
#[derive(Clone, Copy, Debug)]
pub struct WriteBufferingFilter {
    capacity: usize,
}

impl WriteBufferingFilter {
    pub fn new(capacity: usize) -> Result<Self> {
        validate_capacity(capacity)?;
        Ok(Self { capacity })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn wrap(&self, stream: SharedStream) -> Result<SharedStream> {
        Ok(Arc::new(WriteBufferingStream::new(stream, self.capacity)?))
    }
}

#[async_trait]
impl ConnectionFilter for WriteBufferingFilter {
    type ConnectState = ();
    type ListenState = ();

    fn name(&self) -> &'static str {
        "write-buffering"
    }

    fn prepare_connect(
        &self,
        _endpoint: &Endpoint,
        _options: Option<&ConnectionProperties>,
    ) -> Result<()> {
        Ok(())
    }

    fn prepare_listen(&self, _options: Option<&ConnectionProperties>) -> Result<()> {
        Ok(())
    }

    async fn on_connect(
        &self,
        _state: (),
        base: BoxConnection,
        _cancel: &Cancellation,
    ) -> Result<BoxConnection> {
        decorate(base, |stream| self.wrap(stream)).await
    }

    async fn on_accept(
        &self,
        _state: &(),
        base: BoxConnection,
        _cancel: &Cancellation,
    ) -> Result<BoxConnection> {
        decorate(base, |stream| self.wrap(stream)).await
    }
}

fn validate_capacity(capacity: usize) -> Result<()> {
    if capacity == 0 {
        return Err(ConnectionError::new(
            ErrorKind::Configuration,
            INVALID_CAPACITY,
            "write buffer capacity must be positive",
        ));
    }
    Ok(())
}
