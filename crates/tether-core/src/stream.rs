//! # stream 模块说明
//!
//! ## 角色定位（Why）
//! - [`EnhancedStream`] 在单缓冲读写之外提供分散/聚集 IO 与三态刷新原语，
//!   协议层可以把帧头与载荷分别交给传输层，而不必先拼接成连续缓冲；
//! - 所有方法以 `&self` 接收，读方向与写方向互不阻塞，一个读者与一个写者可以并发运行。
//!
//! ## 契约（What）
//! - `read` 仅在源端完成（对端半关闭或连接释放）时返回 0；
//! - [`FlushType::FlushAndShutdownWrites`] 在刷新后半关闭写方向，不支持半关闭的实现必须返回
//!   [`ErrorKind::Unsupported`](crate::ErrorKind::Unsupported)，不得静默忽略。

use std::{
    io::{IoSlice, IoSliceMut},
    sync::Arc,
};

use async_trait::async_trait;
use bytes::BytesMut;

use crate::{
    cancellation::{Cancellation, WriteScope},
    error::{ConnectionError, Result, codes},
};

/// 写入后的刷新策略。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum FlushType {
    /// 允许实现继续缓冲。
    #[default]
    None,
    /// 把已缓冲字节推送到传输层。
    FlushWrites,
    /// 刷新后半关闭写方向，对端读到 EOF，本端仍可继续读取。
    FlushAndShutdownWrites,
}

impl FlushType {
    /// 是否要求推送缓冲。
    pub fn flushes(self) -> bool {
        !matches!(self, FlushType::None)
    }

    /// 是否要求半关闭写方向。
    pub fn shuts_down_writes(self) -> bool {
        matches!(self, FlushType::FlushAndShutdownWrites)
    }
}

/// 增强字节流能力。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 统一内存管道、OS 套接字、TLS 会话与各类测试装饰器的字节流接口；
/// - 通过 `async_trait` 保持对象安全，连接以 `Arc<dyn EnhancedStream>` 持有流。
///
/// ## 契约（What）
/// - `read`/`read_vectored`：至少读取 1 字节后返回；返回 0 表示源端完成，此后继续读取仍返回 0；
/// - `write`/`write_vectored`：写入全部字节后按 `flush` 执行刷新；
/// - 取消与写入：返回 [`ErrorKind::Cancelled`](crate::ErrorKind::Cancelled) 的写入没有让任何字节
///   进入传输；一旦接受了首个字节，调用就会写完，只有释放或传输失败能中止它。调用方因此可以
///   在收到 `Cancelled` 后原样重试，不会产生重复字节；
/// - `dispose`：释放流自身持有的资源，幂等；装饰器流不释放其包装的底层流，
///   底层流由其所属连接负责释放。
///
/// ## 注意事项（Trade-offs）
/// - 默认的 `read_vectored` 只读入第一个非空缓冲，满足“短读即返回”的约定；
///   能一次填充多个缓冲的实现应当覆盖它；
/// - 默认的 `write_vectored` 委托 [`emulate_write_vectored`]。
#[async_trait]
pub trait EnhancedStream: Send + Sync {
    /// 是否支持 [`FlushType::FlushAndShutdownWrites`]。
    fn can_shutdown_writes(&self) -> bool;

    /// 是否原生支持分散/聚集 IO。
    fn can_scatter_gather(&self) -> bool {
        false
    }

    async fn read(&self, buf: &mut [u8], cancel: &Cancellation) -> Result<usize>;

    async fn read_vectored(
        &self,
        bufs: &mut [IoSliceMut<'_>],
        cancel: &Cancellation,
    ) -> Result<usize> {
        match bufs.iter_mut().find(|buf| !buf.is_empty()) {
            Some(buf) => self.read(buf, cancel).await,
            None => Ok(0),
        }
    }

    async fn write(&self, buf: &[u8], flush: FlushType, cancel: &Cancellation) -> Result<()>;

    async fn write_vectored(
        &self,
        bufs: &[IoSlice<'_>],
        flush: FlushType,
        cancel: &Cancellation,
    ) -> Result<()> {
        emulate_write_vectored(self, bufs, flush, cancel).await
    }

    async fn flush(&self, flush: FlushType, cancel: &Cancellation) -> Result<()>;

    async fn dispose(&self) -> Result<()>;
}

/// 连接持有的共享流句柄。
pub type SharedStream = Arc<dyn EnhancedStream>;

/// 合并小缓冲时使用的暂存区大小。
pub const EMULATED_WRITE_SCRATCH: usize = 8 * 1024;

/// 在不支持聚集写的流上模拟 `write_vectored`。
///
/// # 逻辑（How）
/// - 总长度不超过暂存区时拼接后一次写出；
/// - 否则依次把小缓冲累积进暂存区，暂存区放不下时先写出暂存内容，
///   不小于暂存区的缓冲直接写出，不做拷贝；
/// - `flush` 只附加在最后一次底层写入上，中间写入一律使用 [`FlushType::None`]；
/// - 保证至少一次底层写入，空载荷也会把刷新请求传递下去；
/// - 只有第一次底层写入响应取消，之后由 [`WriteScope`] 换用内部令牌写完剩余部分。
pub async fn emulate_write_vectored<S>(
    stream: &S,
    bufs: &[IoSlice<'_>],
    flush: FlushType,
    cancel: &Cancellation,
) -> Result<()>
where
    S: EnhancedStream + ?Sized,
{
    let total: usize = bufs.iter().map(|buf| buf.len()).sum();
    if total <= EMULATED_WRITE_SCRATCH {
        let mut joined = BytesMut::with_capacity(total);
        for buf in bufs {
            joined.extend_from_slice(buf);
        }
        return stream.write(&joined, flush, cancel).await;
    }

    // 拆成多次底层写入前先拒绝不支持的半关闭，避免写出一半再失败。
    ensure_shutdown_supported(stream, flush)?;
    let mut scope = WriteScope::new(cancel);
    let last = bufs.iter().rposition(|buf| !buf.is_empty());
    let mut scratch = BytesMut::with_capacity(EMULATED_WRITE_SCRATCH);
    for (index, buf) in bufs.iter().enumerate() {
        if buf.is_empty() {
            continue;
        }
        let is_last = Some(index) == last;
        let this_flush = if is_last { flush } else { FlushType::None };

        if scratch.len() + buf.len() > EMULATED_WRITE_SCRATCH && !scratch.is_empty() {
            stream.write(&scratch, FlushType::None, scope.token()).await?;
            scope.accepted();
            scratch.clear();
        }

        if buf.len() >= EMULATED_WRITE_SCRATCH {
            stream.write(buf, this_flush, scope.token()).await?;
            scope.accepted();
        } else {
            scratch.extend_from_slice(buf);
            if is_last {
                stream.write(&scratch, this_flush, scope.token()).await?;
                scope.accepted();
                scratch.clear();
            }
        }
    }
    Ok(())
}

/// 校验流是否支持半关闭，供各实现在处理 [`FlushType::FlushAndShutdownWrites`] 前调用。
pub fn ensure_shutdown_supported<S>(stream: &S, flush: FlushType) -> Result<()>
where
    S: EnhancedStream + ?Sized,
{
    if flush.shuts_down_writes() && !stream.can_shutdown_writes() {
        return Err(ConnectionError::unsupported(
            codes::SHUTDOWN_UNSUPPORTED,
            "stream does not support shutting down writes",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, OperationKind};
    use parking_lot::Mutex;

    const WRITE: OperationKind = OperationKind::new("tether.test.write_failed", "test write");

    /// 记录每次底层写入的测试流。
    #[derive(Default)]
    struct RecordingStream {
        writes: Mutex<Vec<(Vec<u8>, FlushType)>>,
        shutdown: bool,
        /// 首次写入成功后取消的调用方令牌。
        cancel_after_first: Option<Cancellation>,
    }

    #[async_trait]
    impl EnhancedStream for RecordingStream {
        fn can_shutdown_writes(&self) -> bool {
            self.shutdown
        }

        async fn read(&self, _buf: &mut [u8], _cancel: &Cancellation) -> Result<usize> {
            Ok(0)
        }

        async fn write(&self, buf: &[u8], flush: FlushType, cancel: &Cancellation) -> Result<()> {
            ensure_shutdown_supported(self, flush)?;
            cancel.check(WRITE)?;
            self.writes.lock().push((buf.to_vec(), flush));
            if let Some(token) = &self.cancel_after_first {
                token.cancel();
            }
            Ok(())
        }

        async fn flush(&self, flush: FlushType, _cancel: &Cancellation) -> Result<()> {
            ensure_shutdown_supported(self, flush)
        }

        async fn dispose(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn small_buffers_are_coalesced() {
        let stream = RecordingStream::default();
        let cancel = Cancellation::new();
        stream
            .write_vectored(
                &[IoSlice::new(b"AB"), IoSlice::new(b"CDE")],
                FlushType::FlushWrites,
                &cancel,
            )
            .await
            .expect("write");
        let writes = stream.writes.lock();
        assert_eq!(writes.as_slice(), &[(b"ABCDE".to_vec(), FlushType::FlushWrites)]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_payload_still_writes_once() {
        let stream = RecordingStream::default();
        stream
            .write_vectored(&[], FlushType::FlushWrites, &Cancellation::new())
            .await
            .expect("write");
        assert_eq!(stream.writes.lock().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn large_buffers_bypass_scratch_and_flush_last() {
        let stream = RecordingStream::default();
        let big = vec![7u8; EMULATED_WRITE_SCRATCH + 1];
        stream
            .write_vectored(
                &[IoSlice::new(b"head"), IoSlice::new(&big), IoSlice::new(b"tail")],
                FlushType::FlushWrites,
                &Cancellation::new(),
            )
            .await
            .expect("write");

        let writes = stream.writes.lock();
        let sizes: Vec<usize> = writes.iter().map(|(bytes, _)| bytes.len()).collect();
        assert_eq!(sizes, vec![4, EMULATED_WRITE_SCRATCH + 1, 4]);
        let flushes: Vec<FlushType> = writes.iter().map(|(_, flush)| *flush).collect();
        assert_eq!(
            flushes,
            vec![FlushType::None, FlushType::None, FlushType::FlushWrites]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_is_rejected_when_unsupported() {
        let stream = RecordingStream::default();
        let err = stream
            .flush(FlushType::FlushAndShutdownWrites, &Cancellation::new())
            .await
            .expect_err("shutdown unsupported");
        assert_eq!(err.kind(), ErrorKind::Unsupported);

        let capable = RecordingStream {
            shutdown: true,
            ..RecordingStream::default()
        };
        capable
            .flush(FlushType::FlushAndShutdownWrites, &Cancellation::new())
            .await
            .expect("shutdown supported");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancellation_after_first_write_does_not_truncate() {
        let cancel = Cancellation::new();
        let stream = RecordingStream {
            cancel_after_first: Some(cancel.clone()),
            ..RecordingStream::default()
        };
        let big = vec![1u8; EMULATED_WRITE_SCRATCH];
        stream
            .write_vectored(
                &[IoSlice::new(&big), IoSlice::new(b"tail")],
                FlushType::FlushWrites,
                &cancel,
            )
            .await
            .expect("remaining writes ignore the caller token");
        assert!(cancel.is_cancelled());
        let sizes: Vec<usize> = stream.writes.lock().iter().map(|(bytes, _)| bytes.len()).collect();
        assert_eq!(sizes, vec![EMULATED_WRITE_SCRATCH, 4]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancelled_before_first_write_accepts_nothing() {
        let cancel = Cancellation::new();
        cancel.cancel();
        let stream = RecordingStream::default();
        let big = vec![1u8; EMULATED_WRITE_SCRATCH];
        let err = stream
            .write_vectored(
                &[IoSlice::new(&big), IoSlice::new(b"tail")],
                FlushType::None,
                &cancel,
            )
            .await
            .expect_err("cancelled");
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(stream.writes.lock().is_empty());
    }
}
