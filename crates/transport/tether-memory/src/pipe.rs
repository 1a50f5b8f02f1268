//! 单向字节管道。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 两条管道组成一对内存连接，取代 OS 套接字完成确定性的协议测试；
//! - 显式的完成信号（写方向关闭）与背压让半关闭、慢读者等场景可复现。
//!
//! ## 逻辑（How）
//! - 背压是写入的准入条件：已提交未读取的字节达到 `pause_writer_threshold` 时写者在接受
//!   任何字节之前挂起，直到读者消费数据；
//! - 获准后整次写入一并追加到 `pending`，满一个分段的部分立即提交到 `readable` 并唤醒读者，
//!   剩余部分等待下一次写入或显式刷新；
//! - 读者等待“至少一个字节可读或管道已完成”，只确认实际拷贝的字节。
//!
//! ## 注意事项（Trade-offs）
//! - 单生产者/单消费者；状态由 `parking_lot::Mutex` 保护，锁不跨越 `.await`；
//! - 取消只可能发生在准入等待中，此时尚未接受任何字节；代价是单次大写入可以让
//!   `readable` 超过阈值，超出量不大于这次写入的长度；
//! - 等待前先 `enable` 通知，再检查状态，避免检查与登记之间的唤醒丢失。

use std::io::{IoSlice, IoSliceMut};

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use serde::Deserialize;
use tether_core::Cancellation;
use tokio::sync::Notify;

/// 每个方向的管道参数。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PipeOptions {
    /// 提交给读者的分段大小。
    pub segment_size: usize,
    /// 已提交未读取字节的上限；`None` 表示不限制。
    pub pause_writer_threshold: Option<usize>,
}

impl PipeOptions {
    pub const DEFAULT_SEGMENT_SIZE: usize = 4096;
    pub const DEFAULT_PAUSE_WRITER_THRESHOLD: usize = 64 * 1024;

    /// 不限制背压的管道。
    pub fn unbounded() -> Self {
        Self {
            pause_writer_threshold: None,
            ..Self::default()
        }
    }

    pub fn with_segment_size(mut self, segment_size: usize) -> Self {
        self.segment_size = segment_size;
        self
    }

    pub fn with_pause_writer_threshold(mut self, threshold: Option<usize>) -> Self {
        self.pause_writer_threshold = threshold;
        self
    }
}

impl Default for PipeOptions {
    fn default() -> Self {
        Self {
            segment_size: Self::DEFAULT_SEGMENT_SIZE,
            pause_writer_threshold: Some(Self::DEFAULT_PAUSE_WRITER_THRESHOLD),
        }
    }
}

/// 管道操作失败的原因，由流层映射为 [`tether_core::ConnectionError`]。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PipeError {
    Cancelled,
    ReaderClosed,
    WriterCompleted,
}

#[derive(Debug, Default)]
struct PipeState {
    readable: BytesMut,
    pending: BytesMut,
    completed: bool,
    reader_closed: bool,
}

#[derive(Debug)]
pub(crate) struct Pipe {
    state: Mutex<PipeState>,
    readable: Notify,
    writable: Notify,
    segment_size: usize,
    pause_writer_threshold: Option<usize>,
}

impl Pipe {
    pub(crate) fn new(options: PipeOptions) -> Self {
        Self {
            state: Mutex::new(PipeState::default()),
            readable: Notify::new(),
            writable: Notify::new(),
            segment_size: options.segment_size.max(1),
            pause_writer_threshold: options.pause_writer_threshold,
        }
    }

    /// 读取可用字节，依次填充 `bufs`；返回 0 仅表示管道已完成且读尽。
    pub(crate) async fn read(
        &self,
        bufs: &mut [IoSliceMut<'_>],
        cancel: &Cancellation,
    ) -> Result<usize, PipeError> {
        if bufs.iter().all(|buf| buf.is_empty()) {
            return Ok(0);
        }
        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if state.reader_closed {
                    return Err(PipeError::ReaderClosed);
                }
                if !state.readable.is_empty() {
                    let copied = copy_into(&mut state.readable, bufs);
                    drop(state);
                    self.writable.notify_waiters();
                    return Ok(copied);
                }
                if state.completed {
                    return Ok(0);
                }
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PipeError::Cancelled),
                _ = &mut notified => {}
            }
        }
    }

    /// 等待背压放行后一次性追加 `bufs`；满分段的部分立即提交。
    ///
    /// 返回 [`PipeError::Cancelled`] 时没有任何字节被接受。
    pub(crate) async fn write(
        &self,
        bufs: &[IoSlice<'_>],
        cancel: &Cancellation,
    ) -> Result<(), PipeError> {
        loop {
            let notified = self.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                state.check_writable()?;
                if !self.is_paused(&state) {
                    for buf in bufs {
                        state.pending.extend_from_slice(buf);
                    }
                    let committed = self.commit_segments(&mut state, false);
                    drop(state);
                    if committed {
                        self.readable.notify_waiters();
                    }
                    return Ok(());
                }
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PipeError::Cancelled),
                _ = &mut notified => {}
            }
        }
    }

    /// 提交全部待提交字节。
    pub(crate) fn flush(&self) -> Result<(), PipeError> {
        let committed = {
            let mut state = self.state.lock();
            state.check_writable()?;
            self.commit_segments(&mut state, true)
        };
        if committed {
            self.readable.notify_waiters();
        }
        Ok(())
    }

    /// 刷新后标记完成，读者读尽后得到 0。
    pub(crate) fn shutdown(&self) -> Result<(), PipeError> {
        {
            let mut state = self.state.lock();
            state.check_writable()?;
            self.commit_segments(&mut state, true);
            state.completed = true;
        }
        self.readable.notify_waiters();
        Ok(())
    }

    /// 写端释放：提交剩余字节并标记完成。
    pub(crate) fn complete(&self) {
        {
            let mut state = self.state.lock();
            if !state.reader_closed {
                let pending = state.pending.split();
                state.readable.extend_from_slice(&pending);
            }
            state.completed = true;
        }
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    /// 读端释放：丢弃未读字节，唤醒被背压挂起的写者。
    pub(crate) fn close_reader(&self) {
        {
            let mut state = self.state.lock();
            state.reader_closed = true;
            state.readable.clear();
            state.pending.clear();
        }
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    fn is_paused(&self, state: &PipeState) -> bool {
        self.pause_writer_threshold
            .is_some_and(|threshold| state.readable.len() >= threshold)
    }

    /// 把满分段（`all` 时包括不足一段的尾部）移入 `readable`，返回是否提交了字节。
    fn commit_segments(&self, state: &mut PipeState, all: bool) -> bool {
        let mut committed = false;
        loop {
            let ready = state.pending.len() >= self.segment_size || (all && !state.pending.is_empty());
            if !ready {
                return committed;
            }
            let take = self.segment_size.min(state.pending.len());
            let segment = state.pending.split_to(take);
            state.readable.extend_from_slice(&segment);
            committed = true;
        }
    }
}

impl PipeState {
    fn check_writable(&self) -> Result<(), PipeError> {
        if self.reader_closed {
            Err(PipeError::ReaderClosed)
        } else if self.completed {
            Err(PipeError::WriterCompleted)
        } else {
            Ok(())
        }
    }
}

fn copy_into(source: &mut BytesMut, bufs: &mut [IoSliceMut<'_>]) -> usize {
    let mut copied = 0;
    for buf in bufs.iter_mut() {
        if source.is_empty() {
            break;
        }
        let n = buf.len().min(source.len());
        buf[..n].copy_from_slice(&source[..n]);
        source.advance(n);
        copied += n;
    }
    copied
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, time::Duration};

    async fn write(pipe: &Pipe, data: &[u8], cancel: &Cancellation) -> Result<(), PipeError> {
        pipe.write(&[IoSlice::new(data)], cancel).await
    }

    async fn read_some(pipe: &Pipe, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        let n = pipe
            .read(&mut [IoSliceMut::new(&mut buf)], &Cancellation::new())
            .await
            .expect("read");
        buf.truncate(n);
        buf
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bytes_become_visible_on_full_segment_or_flush() {
        let pipe = Pipe::new(PipeOptions::default().with_segment_size(4));
        let cancel = Cancellation::new();
        write(&pipe, b"abcdef", &cancel).await.expect("write");
        assert_eq!(read_some(&pipe, 16).await, b"abcd");

        pipe.flush().expect("flush");
        assert_eq!(read_some(&pipe, 16).await, b"ef");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_yields_repeated_eof() {
        let pipe = Pipe::new(PipeOptions::default());
        let cancel = Cancellation::new();
        write(&pipe, b"hi", &cancel).await.expect("write");
        pipe.shutdown().expect("shutdown");
        assert_eq!(read_some(&pipe, 8).await, b"hi");
        assert!(read_some(&pipe, 8).await.is_empty());
        assert!(read_some(&pipe, 8).await.is_empty());
        assert_eq!(
            write(&pipe, b"late", &cancel).await,
            Err(PipeError::WriterCompleted)
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn scatter_read_fills_buffers_in_order() {
        let pipe = Pipe::new(PipeOptions::default());
        let cancel = Cancellation::new();
        write(&pipe, b"ABCDE", &cancel).await.expect("write");
        pipe.flush().expect("flush");

        let (mut head, mut tail) = ([0u8; 2], [0u8; 8]);
        let n = pipe
            .read(
                &mut [IoSliceMut::new(&mut head), IoSliceMut::new(&mut tail)],
                &cancel,
            )
            .await
            .expect("read");
        assert_eq!(n, 5);
        assert_eq!(&head, b"AB");
        assert_eq!(&tail[..3], b"CDE");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn writer_pauses_until_reader_drains() {
        let pipe = Arc::new(Pipe::new(
            PipeOptions::default()
                .with_segment_size(2)
                .with_pause_writer_threshold(Some(2)),
        ));
        write(&pipe, b"abcd", &Cancellation::new()).await.expect("admitted");
        let writer = {
            let pipe = Arc::clone(&pipe);
            tokio::spawn(async move { write(&pipe, b"ef", &Cancellation::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!writer.is_finished(), "writer must be paused by backpressure");

        assert_eq!(read_some(&pipe, 4).await, b"abcd");
        writer.await.expect("join").expect("write completes");
        assert_eq!(read_some(&pipe, 4).await, b"ef");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancelled_paused_write_accepts_nothing() {
        let pipe = Pipe::new(
            PipeOptions::default()
                .with_segment_size(4)
                .with_pause_writer_threshold(Some(4)),
        );
        write(&pipe, b"abcd", &Cancellation::new()).await.expect("admitted");

        let cancel = Cancellation::new();
        let (result, _) = tokio::join!(write(&pipe, b"efgh", &cancel), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        assert_eq!(result, Err(PipeError::Cancelled));

        pipe.shutdown().expect("shutdown");
        assert_eq!(read_some(&pipe, 16).await, b"abcd");
        assert!(read_some(&pipe, 16).await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn closed_reader_breaks_writer() {
        let pipe = Pipe::new(PipeOptions::default().with_segment_size(1));
        pipe.close_reader();
        assert_eq!(
            write(&pipe, b"x", &Cancellation::new()).await,
            Err(PipeError::ReaderClosed)
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pending_read_observes_cancellation() {
        let pipe = Pipe::new(PipeOptions::default());
        let cancel = Cancellation::new();
        cancel.cancel();
        let mut buf = [0u8; 4];
        assert_eq!(
            pipe.read(&mut [IoSliceMut::new(&mut buf)], &cancel).await,
            Err(PipeError::Cancelled)
        );
    }
}
