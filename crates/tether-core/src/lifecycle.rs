//! 连接、监听器与流共用的释放生命周期。
//!
//! 状态机为 `Active → Disposing → Disposed`，只允许单向推进：
//! - 赢得 CAS 的调用方执行拆除逻辑，其余并发调用等待拆除完成后返回 `Ok(())`；
//! - 拆除 Future 即使在中途被丢弃，守卫也会把状态推进到 `Disposed`，避免等待方永久挂起；
//! - `closed()` 在进入 `Disposing` 时即完成，供阻塞中的 `accept`/`read` 及时退出。

use std::{
    future::Future,
    sync::atomic::{AtomicU8, Ordering},
};

use tokio::sync::Notify;
use tracing::warn;

use crate::error::{ConnectionError, Result};

const ACTIVE: u8 = 0;
const DISPOSING: u8 = 1;
const DISPOSED: u8 = 2;

/// 幂等、恰好一次的异步释放状态机。
#[derive(Debug, Default)]
pub struct Lifecycle {
    state: AtomicU8,
    notify: Notify,
}

impl Lifecycle {
    /// 以 `Active` 状态创建。
    pub fn new() -> Self {
        Self::default()
    }

    /// 是否仍处于 `Active`。
    pub fn is_active(&self) -> bool {
        self.state.load(Ordering::Acquire) == ACTIVE
    }

    /// 拆除是否已经全部完成。
    pub fn is_disposed(&self) -> bool {
        self.state.load(Ordering::Acquire) == DISPOSED
    }

    /// 若对象已开始释放则返回 [`ErrorKind::Disposed`](crate::ErrorKind::Disposed)。
    pub fn ensure_active(&self, object: &'static str) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(ConnectionError::disposed(object))
        }
    }

    /// 尝试成为唯一的拆除者。
    ///
    /// 返回的守卫在析构时把状态推进到 `Disposed` 并唤醒等待者；
    /// 返回 `None` 表示其他调用方已经开始（或完成）拆除。
    pub fn try_begin(&self) -> Option<DisposeGuard<'_>> {
        self.state
            .compare_exchange(ACTIVE, DISPOSING, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        self.notify.notify_waiters();
        Some(DisposeGuard { lifecycle: self })
    }

    /// 执行恰好一次的拆除。
    ///
    /// # 契约说明（What）
    /// - 首个调用方执行 `teardown` 并返回其结果；
    /// - 并发或后续调用方等待拆除结束后返回 `Ok(())`，不会再次执行 `teardown`。
    pub async fn dispose_with<F, Fut>(&self, teardown: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        match self.try_begin() {
            Some(guard) => {
                let result = teardown().await;
                drop(guard);
                result
            }
            None => {
                self.wait_for(DISPOSED).await;
                Ok(())
            }
        }
    }

    /// 等待释放开始。
    pub async fn closed(&self) {
        self.wait_for(DISPOSING).await;
    }

    async fn wait_for(&self, at_least: u8) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.state.load(Ordering::Acquire) >= at_least {
                return;
            }
            notified.await;
        }
    }
}

/// 拆除守卫，析构时完成状态迁移。
#[derive(Debug)]
pub struct DisposeGuard<'a> {
    lifecycle: &'a Lifecycle,
}

impl Drop for DisposeGuard<'_> {
    fn drop(&mut self) {
        self.lifecycle.state.store(DISPOSED, Ordering::Release);
        self.lifecycle.notify.notify_waiters();
    }
}

/// 多步骤拆除的结果收集器：每一步都会执行，最终只报告第一个失败。
#[derive(Debug)]
pub struct Teardown {
    object: &'static str,
    first: Option<ConnectionError>,
}

impl Teardown {
    pub fn new(object: &'static str) -> Self {
        Self {
            object,
            first: None,
        }
    }

    /// 记录一步的结果；后续失败只写日志。
    pub fn record(&mut self, result: Result<()>) {
        if let Err(error) = result {
            if self.first.is_none() {
                self.first = Some(error);
            } else {
                warn!(
                    object = self.object,
                    code = error.code(),
                    error = %error,
                    "additional teardown step failed"
                );
            }
        }
    }

    pub fn finish(self) -> Result<()> {
        match self.first {
            Some(error) => {
                warn!(object = self.object, code = error.code(), error = %error, "teardown failed");
                Err(error)
            }
            None => Ok(()),
        }
    }
}
