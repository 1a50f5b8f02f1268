//! 把 [`EnhancedStream`](tether_core::EnhancedStream) 适配为 Tokio 的 `AsyncRead`/`AsyncWrite`，
//! 供 rustls 驱动记录层 IO。
//!
//! # 教案级注释
//!
//! ## 逻辑（How）
//! - 每个方向各保留一个挂起中的底层 Future；`poll_*` 返回 `Pending` 后再次轮询会继续推进
//!   同一个 Future，而不是重新发起 IO；
//! - 底层读取按记录大小整块进行，超出调用方缓冲的部分存入 `leftover`，下次读取优先交付；
//! - 底层 IO 使用适配器自有的取消令牌，TLS 层操作的取消通过丢弃外层 Future 实现，
//!   挂起的底层读写保留在适配器中，下一次操作接着完成，数据不会丢失。
//!
//! ## 注意事项（Trade-offs）
//! - `poll_write` 在首次轮询时拷贝调用方缓冲，rustls 在 `Pending` 之后以同一段密文重试，
//!   因此返回的长度与拷贝的长度一致；
//! - 关闭写方向时，底层流支持半关闭则传递 `FlushAndShutdownWrites`，否则只刷新。

use std::{
    future::Future,
    io,
    pin::Pin,
    task::{Context, Poll, ready},
};

use futures::{FutureExt, future::BoxFuture};
use tether_core::{Cancellation, ConnectionError, FlushType, Result, SharedStream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::tunnel;

/// 单次底层读取的缓冲大小，足以容纳一条完整的 TLS 记录。
const READ_CHUNK: usize = 17 * 1024;

pub(crate) struct StreamIo {
    stream: SharedStream,
    cancel: Cancellation,
    leftover: Vec<u8>,
    consumed: usize,
    read: Option<BoxFuture<'static, Result<Vec<u8>>>>,
    write: Option<BoxFuture<'static, Result<usize>>>,
    flush: Option<BoxFuture<'static, Result<()>>>,
    shutdown: Option<BoxFuture<'static, Result<()>>>,
}

impl StreamIo {
    pub(crate) fn new(stream: SharedStream) -> Self {
        Self {
            stream,
            cancel: Cancellation::new(),
            leftover: Vec::new(),
            consumed: 0,
            read: None,
            write: None,
            flush: None,
            shutdown: None,
        }
    }

    fn poll_pending_write(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let Some(pending) = self.write.as_mut() {
            let result = ready!(pending.as_mut().poll(cx));
            self.write = None;
            result.map_err(tunnel)?;
        }
        Poll::Ready(Ok(()))
    }

    fn poll_control(
        slot: &mut Option<BoxFuture<'static, Result<()>>>,
        stream: &SharedStream,
        cancel: &Cancellation,
        flush: FlushType,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<()>> {
        let pending = slot.get_or_insert_with(|| {
            let stream = SharedStream::clone(stream);
            let cancel = cancel.clone();
            async move { stream.flush(flush, &cancel).await }.boxed()
        });
        let result = ready!(pending.as_mut().poll(cx));
        *slot = None;
        Poll::Ready(result.map_err(tunnel))
    }
}

impl AsyncRead for StreamIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        if this.consumed == this.leftover.len() {
            let capacity = READ_CHUNK.max(buf.remaining());
            let pending = this.read.get_or_insert_with(|| {
                let stream = SharedStream::clone(&this.stream);
                let cancel = this.cancel.clone();
                async move {
                    let mut chunk = vec![0u8; capacity];
                    let read = stream.read(&mut chunk, &cancel).await?;
                    chunk.truncate(read);
                    Ok::<_, ConnectionError>(chunk)
                }
                .boxed()
            });
            let result = ready!(pending.as_mut().poll(cx));
            this.read = None;
            this.leftover = result.map_err(tunnel)?;
            this.consumed = 0;
            if this.leftover.is_empty() {
                return Poll::Ready(Ok(()));
            }
        }

        let available = &this.leftover[this.consumed..];
        let take = available.len().min(buf.remaining());
        buf.put_slice(&available[..take]);
        this.consumed += take;
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for StreamIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let pending = this.write.get_or_insert_with(|| {
            let stream = SharedStream::clone(&this.stream);
            let cancel = this.cancel.clone();
            let data = buf.to_vec();
            async move {
                stream.write(&data, FlushType::None, &cancel).await?;
                Ok::<_, ConnectionError>(data.len())
            }
            .boxed()
        });
        let result = ready!(pending.as_mut().poll(cx));
        this.write = None;
        Poll::Ready(result.map_err(tunnel))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_pending_write(cx))?;
        Self::poll_control(
            &mut this.flush,
            &this.stream,
            &this.cancel,
            FlushType::FlushWrites,
            cx,
        )
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_pending_write(cx))?;
        let flush = if this.stream.can_shutdown_writes() {
            FlushType::FlushAndShutdownWrites
        } else {
            FlushType::FlushWrites
        };
        Self::poll_control(&mut this.shutdown, &this.stream, &this.cancel, flush, cx)
    }
}
