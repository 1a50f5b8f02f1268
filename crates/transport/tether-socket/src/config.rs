use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    time::Duration,
};

use serde::{Deserialize, Deserializer};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tether_core::{ConnectionError, ErrorKind, Result};
use tokio::net::TcpStream;

use crate::error::FAMILY_MISMATCH;

/// 套接字地址族策略。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressFamily {
    /// 平台支持时使用双栈 IPv6，否则回退 IPv4。
    #[default]
    Unspecified,
    V4,
    V6,
}

/// TCP 套接字配置。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把地址族、`TCP_NODELAY`、监听队列长度与 `SO_LINGER` 收敛为一个可序列化的配置，
///   宿主可以从 TOML 加载，也可以通过能力包为单次 `connect`/`listen` 覆盖；
/// - 调用方无需直接操作 `socket2` 或平台相关常量。
///
/// ## 契约（What）
/// - `family`：默认 [`AddressFamily::Unspecified`]；
/// - `nodelay`：默认 `true`；
/// - `backlog`：默认 512；
/// - `linger`：`None` 表示沿用内核默认；TOML 中以秒为单位书写。
///
/// ## 注意事项（Trade-offs）
/// - `SO_LINGER` 在 Linux 上取整到秒；设置过小可能导致发送缓冲区中的数据被 RST 丢弃。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    pub family: AddressFamily,
    pub nodelay: bool,
    pub backlog: i32,
    #[serde(deserialize_with = "linger_from_secs")]
    pub linger: Option<Duration>,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            family: AddressFamily::Unspecified,
            nodelay: true,
            backlog: 512,
            linger: None,
        }
    }
}

impl SocketConfig {
    pub fn with_family(mut self, family: AddressFamily) -> Self {
        self.family = family;
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn with_backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger = linger;
        self
    }

    /// 为出站连接确定地址族与最终目标地址。
    ///
    /// `V6` 策略下 IPv4 目标改写为 IPv4 映射地址，经由双栈套接字连接。
    pub(crate) fn resolve_connect(&self, target: SocketAddr) -> Result<(Domain, SocketAddr, bool)> {
        match (self.family, target) {
            (AddressFamily::V4, SocketAddr::V6(_)) => Err(family_mismatch(target, "IPv4")),
            (AddressFamily::V6, SocketAddr::V4(v4)) => {
                let mapped = SocketAddr::new(IpAddr::V6(v4.ip().to_ipv6_mapped()), v4.port());
                Ok((Domain::IPV6, mapped, true))
            }
            _ => Ok((Domain::for_address(target), target, false)),
        }
    }

    /// 监听地址缺省时使用的通配地址，以及是否启用双栈。
    pub(crate) fn wildcard(&self) -> (SocketAddr, bool) {
        match self.family {
            AddressFamily::V4 => (SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0), false),
            AddressFamily::V6 => (SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0), false),
            AddressFamily::Unspecified => (SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0), true),
        }
    }

    /// 创建非阻塞 TCP 套接字；`dual_stack` 时关闭 `IPV6_V6ONLY`。
    pub(crate) fn open(&self, domain: Domain, dual_stack: bool) -> io::Result<Socket> {
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        if dual_stack && domain == Domain::IPV6 {
            socket.set_only_v6(false)?;
        }
        socket.set_nonblocking(true)?;
        Ok(socket)
    }

    /// 把连接级选项写入已建立的流。
    pub(crate) fn apply(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(self.nodelay)?;
        SockRef::from(stream).set_linger(self.linger)
    }
}

fn family_mismatch(target: SocketAddr, family: &str) -> ConnectionError {
    ConnectionError::new(
        ErrorKind::Address,
        FAMILY_MISMATCH,
        format!("{target} cannot be reached with an {family}-only socket"),
    )
}

fn linger_from_secs<'de, D>(deserializer: D) -> core::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
}
