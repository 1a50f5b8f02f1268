#![doc = r#"
# tether-tls

## 设计动机（Why）
- TLS 以 [`TlsFilter`] 装饰器叠加在任意连接工厂之上，内存管道与 OS 套接字共享同一实现；
- 服务端证书通过 [`HotReloadingServerConfig`] 原子替换，无需重建监听器。

## 核心契约（What）
- 出站连接要求能力包中存在 [`TlsClientOptions`]，监听要求 [`TlsServerOptions`]，
  缺失时在建立基础连接前返回 `Configuration` 错误；
- 握手成功后连接发布 [`TlsSessionInfo`] 能力，流替换为 [`TlsSessionStream`]；
- 握手失败时基础连接恰好释放一次，错误分类为 `Handshake`（底层传输失败保持原分类）。

## 实现策略（How）
- rustls 通过内部 IO 适配层驱动被包装连接的增强字节流；
- 加密提供者由调用方构造的 `ClientConfig`/`ServerConfig` 决定，本 crate 不做全局安装。
"#]

pub mod error;
mod filter;
mod io;
mod options;
mod session;
mod stream;

pub use filter::{TlsConnectionFactory, TlsFilter, tls_factory};
pub use options::{HotReloadingServerConfig, TlsClientOptions, TlsServerOptions};
pub use session::{TlsSessionInfo, TlsSide};
pub use stream::TlsSessionStream;
