use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::sync::Notify;

use crate::error::{ConnectionError, OperationKind, Result};

/// 取消原语，统一表达跨模块的可中断性契约。
///
/// # 设计背景（Why）
/// - 连接层的每个公开异步操作都接受取消信号；调用方需要在“本次调用被取消”
///   与“监听器已关闭”之间做出可观察的区分。
/// - 取消位之外附带 [`Notify`]，等待方在取消发生时立即被唤醒，无需定时轮询。
///
/// # 逻辑解析（How）
/// - 内部使用 [`AtomicBool`] 表达取消状态，并通过 [`Arc`] 支持多方共享；
/// - `cancel` 在首次成功设置取消位时返回 `true` 并唤醒全部等待者；
/// - `cancelled` 先登记通知再检查标志，避免“检查后、登记前”被取消导致的丢失唤醒。
///
/// # 契约说明（What）
/// - **前置条件**：构造时无需额外参数，默认处于“未取消”状态。
/// - **后置条件**：一旦 `cancel` 成功，`is_cancelled` 全局可见，所有克隆共享同一状态。
#[derive(Clone, Debug, Default)]
pub struct Cancellation {
    inner: Arc<CancellationState>,
}

#[derive(Debug, Default)]
struct CancellationState {
    flag: AtomicBool,
    notify: Notify,
}

impl Cancellation {
    /// 创建处于“未取消”状态的取消令牌。
    pub fn new() -> Self {
        Self::default()
    }

    /// 查询当前是否已被标记取消。
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    /// 将当前令牌标记为取消。
    ///
    /// 返回值为 `true` 表示本次调用首次触发取消；返回 `false` 表示之前已被取消。
    pub fn cancel(&self) -> bool {
        let first = self
            .inner
            .flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            self.inner.notify.notify_waiters();
        }
        first
    }

    /// 派生共享同一原子位的子令牌，用于跨模块传播取消语义。
    pub fn child(&self) -> Self {
        self.clone()
    }

    /// 等待令牌被取消。
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// 若已取消则立即返回取消错误。
    pub fn check(&self, kind: OperationKind) -> Result<()> {
        if self.is_cancelled() {
            Err(ConnectionError::cancelled(kind))
        } else {
            Ok(())
        }
    }
}

/// 由多次底层写入组成的一次逻辑写入的取消范围。
///
/// # 契约说明（What）
/// - 写入返回 `Cancelled` 时，本次调用的字节一个都没有被接受；
/// - 首次底层写入仍响应调用方的令牌；[`accepted`](Self::accepted) 之后改用内部令牌，
///   调用写完剩余数据，只有释放或传输失败才会中止。
#[derive(Debug)]
pub struct WriteScope<'a> {
    caller: &'a Cancellation,
    detached: Option<Cancellation>,
}

impl<'a> WriteScope<'a> {
    pub fn new(caller: &'a Cancellation) -> Self {
        Self {
            caller,
            detached: None,
        }
    }

    /// 下一次底层写入应使用的令牌。
    pub fn token(&self) -> &Cancellation {
        self.detached.as_ref().unwrap_or(self.caller)
    }

    /// 记录底层已接受字节，此后不再响应调用方的取消。
    pub fn accepted(&mut self) {
        if self.detached.is_none() {
            self.detached = Some(Cancellation::new());
        }
    }

    pub fn has_accepted(&self) -> bool {
        self.detached.is_some()
    }
}

/// 在保留取消语义的前提下执行 Future。
///
/// - 取消分支优先（`biased`），已取消的令牌不会让 IO Future 被轮询；
/// - 被取消时丢弃 `future`，由其析构负责回滚半完成的状态。
pub async fn run_with_cancellation<F, T>(
    cancellation: &Cancellation,
    kind: OperationKind,
    future: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    cancellation.check(kind)?;
    tokio::select! {
        biased;
        _ = cancellation.cancelled() => Err(ConnectionError::cancelled(kind)),
        result = future => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::time::Duration;

    const WAIT: OperationKind = OperationKind::new("tether.test.wait_failed", "test wait");

    #[test]
    fn cancel_reports_first_transition_only() {
        let token = Cancellation::new();
        let child = token.child();
        assert!(!child.is_cancelled());
        assert!(token.cancel());
        assert!(!child.cancel());
        assert!(child.is_cancelled());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pending_future_is_interrupted() {
        let token = Cancellation::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result = run_with_cancellation(&token, WAIT, std::future::pending::<Result<()>>()).await;
        let err = result.expect_err("pending future must be cancelled");
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn completed_future_wins_when_not_cancelled() {
        let token = Cancellation::new();
        let value = run_with_cancellation(&token, WAIT, async { Ok(7) })
            .await
            .expect("future completes");
        assert_eq!(value, 7);
    }
}
