#![doc = r#"
# tether-memory

## 设计动机（Why）
- 以两条单向字节管道组成一对连接，在不触碰 OS 套接字的情况下完成确定性的协议测试；
- 进程内注册表复现地址冲突、连接拒绝与监听器优雅关闭等行为。

## 核心契约（What）
- [`MemoryConnectionFactory`]：`listen` 在地址已注册时返回 `AddressInUse`，`connect`
  在无监听器时返回 `Connectivity`；
- [`MemoryConnectionListener`]：释放后排队中的连接请求以 `Connectivity` 失败，
  等待中的 `accept` 返回 `Ok(None)`；
- [`MemoryStream`]：原生分散/聚集 IO 与半关闭，背压由 [`PipeOptions`] 控制。
"#]

mod connection;
pub mod error;
mod factory;
mod pipe;

pub use connection::{MemoryConnection, MemoryStream};
pub use factory::{MemoryConnectionFactory, MemoryConnectionListener, MemoryTransportOptions};
pub use pipe::PipeOptions;
