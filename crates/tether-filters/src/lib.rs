#![doc = r#"
# tether-filters

## 设计动机（Why）
- 写合并与 IO 分片都只改变字节流的呈现方式，不涉及连接的建立过程；
  以流装饰器实现后，可以叠加在任意传输或 TLS 之上。

## 组成（What）
- [`WriteBufferingStream`] / [`WriteBufferingFilter`]：把小块写入合并到固定容量的缓冲，
  满或刷新时再交给底层；
- [`TricklingStream`] / [`TricklingFilter`]：按循环长度序列切碎读写，用于暴露
  “一次读写即完整消息”的错误假设。

## 注意事项（Trade-offs）
- 两类流的释放都只结束本层生命周期，底层流随所属连接一同释放。
"#]

mod buffering;
pub mod error;
mod trickle;

pub use buffering::{WriteBufferingFilter, WriteBufferingStream};
pub use trickle::{TricklingFilter, TricklingStream};

use std::sync::Arc;

use tether_core::{BoxConnection, FilteringConnection, Result, SharedStream};
use tracing::warn;

/// 以 `wrap` 包装基础连接的流；任一步失败都会先释放基础连接。
pub(crate) async fn decorate(
    base: BoxConnection,
    wrap: impl FnOnce(SharedStream) -> Result<SharedStream>,
) -> Result<BoxConnection> {
    let wrapped = base.stream().map(Arc::clone).and_then(wrap);
    match wrapped {
        Ok(stream) => Ok(Box::new(FilteringConnection::new(base).with_stream(stream))),
        Err(err) => {
            if let Err(dispose_err) = base.dispose().await {
                warn!(error = %dispose_err, "failed to release base connection after decoration error");
            }
            Err(err)
        }
    }
}
