use std::{
    io::{self, IoSlice, IoSliceMut},
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use tether_core::{
    Cancellation, ConnectionError, EnhancedStream, ErrorKind, FlushType, Lifecycle,
    Result, WriteScope, codes, map_io_error, run_with_cancellation,
};
use tokio::{
    io::AsyncWriteExt,
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::Mutex as AsyncMutex,
};

use crate::error::{READ, SHUTDOWN, WRITE};

/// TCP 连接上的增强字节流。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 读写两个方向拆分为独立的半部，分别由各自的异步互斥锁保护，读者与写者互不阻塞；
/// - 写方向的半关闭直接映射为 TCP FIN，对端读到 EOF 后本端仍可继续读取。
///
/// ## 逻辑（How）
/// - `read_vectored` 以 `readable()` + `try_read_vectored` 一次填充多个缓冲；
/// - `write_vectored` 循环调用 vectored 写并用 [`IoSlice::advance_slices`] 推进，直至全部写出；
/// - 所有 IO 与生命周期的 `closed()` 竞争，释放开始后在途操作立即以 `Disposed` 返回并交还锁；
/// - 写入只在取得写锁与首次 vectored 写之前响应取消，内核接受首个字节后写完剩余部分。
///
/// ## 注意事项（Trade-offs）
/// - 套接字没有用户态写缓冲，[`FlushType::FlushWrites`] 只调用底层 `flush`；
/// - 释放时丢弃两个半部，文件描述符在两者都被丢弃后关闭，`SO_LINGER` 在此时生效。
#[derive(Debug)]
pub struct SocketStream {
    reader: AsyncMutex<Option<OwnedReadHalf>>,
    writer: AsyncMutex<Option<OwnedWriteHalf>>,
    writes_shut_down: AtomicBool,
    lifecycle: Lifecycle,
}

impl SocketStream {
    pub(crate) fn new(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: AsyncMutex::new(Some(reader)),
            writer: AsyncMutex::new(Some(writer)),
            writes_shut_down: AtomicBool::new(false),
            lifecycle: Lifecycle::new(),
        }
    }

    /// 在生命周期关闭的约束下执行一次 IO；取消由各操作自行决定在哪些阶段响应。
    async fn guarded<F, T>(&self, op: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.lifecycle.ensure_active("socket stream")?;
        tokio::select! {
            biased;
            _ = self.lifecycle.closed() => Err(ConnectionError::disposed("socket stream")),
            result = op => result,
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.writes_shut_down.load(Ordering::Acquire) {
            return Err(ConnectionError::new(
                ErrorKind::InvalidState,
                codes::WRITES_SHUT_DOWN,
                "socket writes have been shut down",
            ));
        }
        Ok(())
    }

    async fn write_all_vectored(
        &self,
        bufs: &[IoSlice<'_>],
        flush: FlushType,
        cancel: &Cancellation,
    ) -> Result<()> {
        self.ensure_writable()?;
        self.guarded(async {
            let mut guard =
                run_with_cancellation(cancel, WRITE, async { Ok(self.writer.lock().await) }).await?;
            let half = guard
                .as_mut()
                .ok_or_else(|| ConnectionError::disposed("socket stream"))?;

            // 未完成的 `write_vectored` 没有写出任何字节，首个字节被内核接受前可以安全取消。
            let mut scope = WriteScope::new(cancel);
            let mut storage = bufs.to_vec();
            let mut slices: &mut [IoSlice<'_>] = &mut storage;
            IoSlice::advance_slices(&mut slices, 0);
            while !slices.is_empty() {
                let written = run_with_cancellation(scope.token(), WRITE, async {
                    half.write_vectored(&*slices)
                        .await
                        .map_err(|err| map_io_error(WRITE, err))
                })
                .await?;
                if written == 0 {
                    return Err(map_io_error(WRITE, io::Error::from(io::ErrorKind::WriteZero)));
                }
                scope.accepted();
                IoSlice::advance_slices(&mut slices, written);
            }

            match flush {
                FlushType::None => Ok(()),
                FlushType::FlushWrites => {
                    run_with_cancellation(scope.token(), WRITE, async {
                        half.flush().await.map_err(|err| map_io_error(WRITE, err))
                    })
                    .await
                }
                FlushType::FlushAndShutdownWrites => {
                    run_with_cancellation(scope.token(), SHUTDOWN, async {
                        half.shutdown()
                            .await
                            .map_err(|err| map_io_error(SHUTDOWN, err))
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
impl EnhancedStream for SocketStream {
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
        if bufs.iter().all(|buf| buf.is_empty()) {
            return Ok(0);
        }
        self.guarded(run_with_cancellation(cancel, READ, async {
            let guard = self.reader.lock().await;
            let half = guard
                .as_ref()
                .ok_or_else(|| ConnectionError::disposed("socket stream"))?;
            loop {
                half.readable()
                    .await
                    .map_err(|err| map_io_error(READ, err))?;
                match half.try_read_vectored(bufs) {
                    Ok(read) => return Ok(read),
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => return Err(map_io_error(READ, err)),
                }
            }
        }))
        .await
    }

    async fn write(&self, buf: &[u8], flush: FlushType, cancel: &Cancellation) -> Result<()> {
        self.write_all_vectored(&[IoSlice::new(buf)], flush, cancel)
            .await
    }

    async fn write_vectored(
        &self,
        bufs: &[IoSlice<'_>],
        flush: FlushType,
        cancel: &Cancellation,
    ) -> Result<()> {
        self.write_all_vectored(bufs, flush, cancel).await
    }

    async fn flush(&self, flush: FlushType, cancel: &Cancellation) -> Result<()> {
        self.write_all_vectored(&[], flush, cancel).await
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
