#![doc = r#"
# tether-socket

## 设计动机（Why）
- 以 Tokio + `socket2` 实现真实的 TCP 连接工厂与监听器，供生产环境与跨进程测试使用；
- 原始套接字通过能力包中的 [`SocketHandle`] 暴露，而不是扩宽基础连接契约。

## 核心契约（What）
- [`SocketConnectionFactory`]：`connect` 把通配目标替换为回环地址，任何失败分支都会先关闭套接字；
- [`SocketConnectionListener`]：单次 `accept` 的取消返回 `Cancelled` 而监听器保持可用，
  释放监听器让在途 `accept` 返回 `Ok(None)`；
- [`SocketStream`]：读写半部独立加锁，支持分散/聚集 IO 与写方向半关闭。
"#]

mod config;
mod connection;
pub mod error;
mod factory;
mod listener;
mod stream;

pub use config::{AddressFamily, SocketConfig};
pub use connection::{SocketConnection, SocketHandle};
pub use factory::SocketConnectionFactory;
pub use listener::SocketConnectionListener;
pub use stream::SocketStream;
