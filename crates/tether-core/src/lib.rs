#![doc = r#"
# tether-core

## 设计动机（Why）
- 为内存管道、OS 套接字与 TLS 等传输提供统一的连接抽象：连接、连接工厂、监听器、
  能力包与增强字节流；
- 横切行为（TLS、写合并、测试用的 IO 分片）以装饰器链组合，而不是扩宽基础契约。

## 核心契约（What）
- [`Connection`]/[`ConnectionFactory`]/[`ConnectionListener`]：所有公开异步操作接受
  [`Cancellation`]，`accept` 以 `Ok(None)` 区分“监听器已关闭”与“本次调用被取消”；
- [`ConnectionProperties`]：类型键能力包，首次成功读取后冻结；
- [`EnhancedStream`]：分散/聚集 IO 与三态 [`FlushType`]；
- [`ConnectionError`]：统一错误域，[`ErrorKind`] 为调用方的处置依据。

## 实现策略（How）
- 释放流程统一由 [`Lifecycle`] 驱动，保证并发释放只执行一次拆除；
- 装饰器通过 [`ConnectionFilter`] 与通用的 [`FilteringConnectionFactory`] 组合。
"#]

pub mod cancellation;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod filter;
pub mod lifecycle;
pub mod properties;
pub mod stream;

pub use cancellation::{Cancellation, WriteScope, run_with_cancellation};
pub use connection::{
    BoxConnection, BoxFactory, BoxListener, Connection, ConnectionFactory, ConnectionListener,
};
pub use endpoint::Endpoint;
pub use error::{ConnectionError, ErrorKind, OperationKind, Result, codes, map_io_error};
pub use filter::{
    ConnectionFilter, FilteringConnection, FilteringConnectionFactory, FilteringConnectionListener,
};
pub use lifecycle::{DisposeGuard, Lifecycle, Teardown};
pub use properties::{ConnectionProperties, Extensions};
pub use stream::{
    EMULATED_WRITE_SCRATCH, EnhancedStream, FlushType, SharedStream, emulate_write_vectored,
    ensure_shutdown_supported,
};
