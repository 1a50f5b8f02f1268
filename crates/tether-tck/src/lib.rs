#![doc = r#"
# tether-tck

## 章节定位（Why）
- **目标**：为每个传输实现与装饰器提供同一组可复用的契约断言，任何实现只要构造一个
  [`TransportFixture`] 即可接入全部用例；
- **覆盖面**：往返与半关闭、多缓冲写入、监听器关闭、地址冲突、单次 `accept` 取消与重复释放。

## 结构概览（How）
- [`fixture`]：描述被测传输（工厂、监听地址与能力包），并提供建连辅助；
- [`contract`]：`assert_*` 断言函数，返回 `anyhow::Result<()>`，失败信息经由 `anyhow::Context` 定位到步骤；
- [`tls`]：测试用的自签名 PKI 与 rustls 配置构造。
"#]

pub mod contract;
pub mod fixture;
pub mod tls;

pub use fixture::TransportFixture;
