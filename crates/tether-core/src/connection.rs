use std::any::{Any, TypeId};

use async_trait::async_trait;

use crate::{
    cancellation::Cancellation,
    endpoint::Endpoint,
    error::Result,
    properties::ConnectionProperties,
    stream::SharedStream,
};

/// 已建立的双工连接。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 协议层只通过 [`stream`](Self::stream) 读写字节，不感知底层是内存管道、OS 套接字还是 TLS；
/// - 传输特有的扩展对象通过 [`property`](Self::property) 按类型探测，查不到即“不支持”。
///
/// ## 契约（What）
/// - 每个连接恰好拥有一个增强字节流；
/// - `dispose` 幂等且恰好执行一次拆除，之后 `stream` 返回
///   [`ErrorKind::Disposed`](crate::ErrorKind::Disposed)；
/// - 拆除释放流、装饰器附加的资源，并向被包装的基础连接传播，任一步失败都不影响后续步骤。
#[async_trait]
pub trait Connection: Send + Sync {
    fn local_endpoint(&self) -> Option<&Endpoint>;

    fn remote_endpoint(&self) -> Option<&Endpoint>;

    fn stream(&self) -> Result<&SharedStream>;

    /// 以类型键查找扩展能力。
    fn property(&self, key: TypeId) -> Option<&(dyn Any + Send + Sync)>;

    async fn dispose(&self) -> Result<()>;
}

impl dyn Connection {
    /// [`Connection::property`] 的类型化便捷入口。
    pub fn try_get_property<T>(&self) -> Option<&T>
    where
        T: Any + Send + Sync,
    {
        self.property(TypeId::of::<T>())?.downcast_ref::<T>()
    }
}

pub type BoxConnection = Box<dyn Connection>;

/// 创建出站连接与监听器的工厂。
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// 建立到 `endpoint` 的连接。
    ///
    /// 失败分类：地址缺失或格式不被支持为 `Address`，底层失败为 `Connectivity`，
    /// 取消为 `Cancelled`。
    async fn connect(
        &self,
        endpoint: &Endpoint,
        options: Option<&ConnectionProperties>,
        cancel: &Cancellation,
    ) -> Result<BoxConnection>;

    /// 在 `endpoint` 上监听；`None` 表示绑定通配地址。
    ///
    /// 地址已被占用时返回 `AddressInUse`。
    async fn listen(
        &self,
        endpoint: Option<&Endpoint>,
        options: Option<&ConnectionProperties>,
        cancel: &Cancellation,
    ) -> Result<BoxListener>;

    async fn dispose(&self) -> Result<()> {
        Ok(())
    }
}

pub type BoxFactory = Box<dyn ConnectionFactory>;

/// 已绑定的监听器。
///
/// ## 契约（What）
/// - `accept` 可重复调用，每次返回下一个入站连接；
/// - 仅当监听器本身被关闭时返回 `Ok(None)`；单次调用被取消时返回
///   [`ErrorKind::Cancelled`](crate::ErrorKind::Cancelled)，监听器保持可用；
/// - `dispose` 恰好释放一次地址注册，并唤醒所有等待中的 `accept`。
#[async_trait]
pub trait ConnectionListener: Send + Sync {
    fn local_endpoint(&self) -> &Endpoint;

    async fn accept(
        &self,
        options: Option<&ConnectionProperties>,
        cancel: &Cancellation,
    ) -> Result<Option<BoxConnection>>;

    async fn dispose(&self) -> Result<()>;
}

pub type BoxListener = Box<dyn ConnectionListener>;
