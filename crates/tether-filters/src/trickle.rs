//! IO 分片装饰器。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 协议实现经常隐含“一次读写即可收发完整消息”的假设；按循环的长度序列切碎每次读写，
//!   可以确定性地暴露这类缺陷；
//! - `force_yield` 让每次操作在完成前让出执行权，即使底层同步完成也会经历一次调度。
//!
//! ## 逻辑（How）
//! - 读：每次读取的上限取序列的下一项（`[1, 3]` → 1, 3, 1, 3, …），分散读把上限分摊到多个缓冲；
//! - 写：调用方缓冲按序列切块依次写出，刷新类型只附加在最后一块上；
//!   聚集写在底层支持时按块重组切片列表，否则退化为模拟实现；
//! - 读写各自维护序列游标，互不影响。
//!
//! ## 契约（What）
//! - 分片不改变字节内容与顺序；
//! - 只有第一块响应取消，返回 `Cancelled` 时底层流没有收到任何块；
//! - 释放只结束本层生命周期，不释放底层流。

use std::{
    io::{IoSlice, IoSliceMut},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use tether_core::{
    BoxConnection, Cancellation, ConnectionError, ConnectionFilter, ConnectionProperties,
    EnhancedStream, Endpoint, ErrorKind, FlushType, Lifecycle, Result, SharedStream, WriteScope,
    emulate_write_vectored, ensure_shutdown_supported,
};

use crate::{
    decorate,
    error::{INVALID_SEQUENCE, READ, WRITE},
};

/// 循环的长度序列与其游标。
#[derive(Debug)]
struct Sequence {
    sizes: Arc<[usize]>,
    cursor: AtomicUsize,
}

impl Sequence {
    fn new(sizes: Arc<[usize]>) -> Self {
        Self {
            sizes,
            cursor: AtomicUsize::new(0),
        }
    }

    fn next(&self) -> usize {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed);
        self.sizes[index % self.sizes.len()]
    }
}

/// 按长度序列切碎读写的流。
pub struct TricklingStream {
    base: SharedStream,
    reads: Sequence,
    writes: Sequence,
    force_yield: bool,
    lifecycle: Lifecycle,
}

impl TricklingStream {
    /// 两个序列都必须非空且不含 0。
    pub fn new(
        base: SharedStream,
        read_sequence: &[usize],
        write_sequence: &[usize],
        force_yield: bool,
    ) -> Result<Self> {
        Ok(Self::from_parts(
            base,
            validate_sequence(read_sequence)?,
            validate_sequence(write_sequence)?,
            force_yield,
        ))
    }

    fn from_parts(
        base: SharedStream,
        reads: Arc<[usize]>,
        writes: Arc<[usize]>,
        force_yield: bool,
    ) -> Self {
        Self {
            base,
            reads: Sequence::new(reads),
            writes: Sequence::new(writes),
            force_yield,
            lifecycle: Lifecycle::new(),
        }
    }

    fn ensure_active(&self) -> Result<()> {
        self.lifecycle.ensure_active("trickling stream")
    }

    async fn settle<T>(&self, result: Result<T>) -> Result<T> {
        if self.force_yield {
            tokio::task::yield_now().await;
        }
        result
    }
}

#[async_trait]
impl EnhancedStream for TricklingStream {
    fn can_shutdown_writes(&self) -> bool {
        self.base.can_shutdown_writes()
    }

    fn can_scatter_gather(&self) -> bool {
        self.base.can_scatter_gather()
    }

    async fn read(&self, buf: &mut [u8], cancel: &Cancellation) -> Result<usize> {
        self.ensure_active()?;
        cancel.check(READ)?;
        let limit = buf.len().min(self.reads.next());
        let result = self.base.read(&mut buf[..limit], cancel).await;
        self.settle(result).await
    }

    async fn read_vectored(
        &self,
        bufs: &mut [IoSliceMut<'_>],
        cancel: &Cancellation,
    ) -> Result<usize> {
        if !self.base.can_scatter_gather() {
            return match bufs.iter_mut().find(|buf| !buf.is_empty()) {
                Some(buf) => self.read(buf, cancel).await,
                None => Ok(0),
            };
        }

        self.ensure_active()?;
        cancel.check(READ)?;
        let mut budget = self.reads.next();
        let mut limited = Vec::with_capacity(bufs.len());
        for buf in bufs.iter_mut() {
            if budget == 0 {
                break;
            }
            let take = buf.len().min(budget);
            budget -= take;
            limited.push(IoSliceMut::new(&mut buf[..take]));
        }
        let result = self.base.read_vectored(&mut limited, cancel).await;
        self.settle(result).await
    }

    async fn write(&self, buf: &[u8], flush: FlushType, cancel: &Cancellation) -> Result<()> {
        self.ensure_active()?;
        // 切块之前拒绝不支持的半关闭，否则前面的块已经写出。
        ensure_shutdown_supported(self, flush)?;
        cancel.check(WRITE)?;
        if buf.is_empty() {
            let result = self.base.write(buf, flush, cancel).await;
            return self.settle(result).await;
        }

        let mut scope = WriteScope::new(cancel);
        let mut remaining = buf;
        while !remaining.is_empty() {
            let take = remaining.len().min(self.writes.next());
            let (chunk, rest) = remaining.split_at(take);
            let chunk_flush = if rest.is_empty() { flush } else { FlushType::None };
            self.base.write(chunk, chunk_flush, scope.token()).await?;
            scope.accepted();
            remaining = rest;
        }
        self.settle(Ok(())).await
    }

    async fn write_vectored(
        &self,
        bufs: &[IoSlice<'_>],
        flush: FlushType,
        cancel: &Cancellation,
    ) -> Result<()> {
        if !self.base.can_scatter_gather() {
            return emulate_write_vectored(self, bufs, flush, cancel).await;
        }

        self.ensure_active()?;
        ensure_shutdown_supported(self, flush)?;
        cancel.check(WRITE)?;
        let mut scope = WriteScope::new(cancel);
        let mut group: Vec<IoSlice<'_>> = Vec::new();
        let mut take = 0usize;
        for buf in bufs {
            let mut rest: &[u8] = buf;
            while !rest.is_empty() {
                if take == 0 {
                    if !group.is_empty() {
                        self.base
                            .write_vectored(&group, FlushType::None, scope.token())
                            .await?;
                        scope.accepted();
                        group.clear();
                    }
                    take = self.writes.next();
                }
                let step = rest.len().min(take);
                let (chunk, tail) = rest.split_at(step);
                group.push(IoSlice::new(chunk));
                rest = tail;
                take -= step;
            }
        }

        let result = self.base.write_vectored(&group, flush, scope.token()).await;
        self.settle(result).await
    }

    async fn flush(&self, flush: FlushType, cancel: &Cancellation) -> Result<()> {
        self.ensure_active()?;
        let result = self.base.flush(flush, cancel).await;
        self.settle(result).await
    }

    async fn dispose(&self) -> Result<()> {
        self.lifecycle.dispose_with(|| async { Ok(()) }).await
    }
}

/// 为每条连接叠加 [`TricklingStream`] 的装饰器；每条连接的序列游标独立从头开始。
#[derive(Clone, Debug)]
pub struct TricklingFilter {
    reads: Arc<[usize]>,
    writes: Arc<[usize]>,
    force_yield: bool,
}

impl TricklingFilter {
    pub fn new(read_sequence: &[usize], write_sequence: &[usize], force_yield: bool) -> Result<Self> {
        Ok(Self {
            reads: validate_sequence(read_sequence)?,
            writes: validate_sequence(write_sequence)?,
            force_yield,
        })
    }

    /// 读写使用同一序列。
    pub fn symmetric(sequence: &[usize], force_yield: bool) -> Result<Self> {
        Self::new(sequence, sequence, force_yield)
    }

    fn wrap(&self, stream: SharedStream) -> Result<SharedStream> {
        Ok(Arc::new(TricklingStream::from_parts(
            stream,
            Arc::clone(&self.reads),
            Arc::clone(&self.writes),
            self.force_yield,
        )))
    }
}

#[async_trait]
impl ConnectionFilter for TricklingFilter {
    type ConnectState = ();
    type ListenState = ();

    fn name(&self) -> &'static str {
        "trickling"
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

fn validate_sequence(sizes: &[usize]) -> Result<Arc<[usize]>> {
    if sizes.is_empty() || sizes.contains(&0) {
        return Err(ConnectionError::new(
            ErrorKind::Configuration,
            INVALID_SEQUENCE,
            format!("trickle sequence must be non-empty and positive, got {sizes:?}"),
        ));
    }
    Ok(Arc::from(sizes))
}
