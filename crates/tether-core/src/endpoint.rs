use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
};

/// 连接端点地址。
///
/// - `Ip`：OS 套接字使用的 IP + 端口；
/// - `Named`：内存传输使用的逻辑名称；
/// - `Anonymous`：内存监听器未指定地址时分配的哨兵值，仅在同一注册表内有效。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Ip(SocketAddr),
    Named(Arc<str>),
    Anonymous(u64),
}

impl Endpoint {
    /// 以逻辑名称构造内存端点。
    pub fn named(name: impl Into<Arc<str>>) -> Self {
        Endpoint::Named(name.into())
    }

    pub fn as_socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Endpoint::Ip(addr) => Some(*addr),
            _ => None,
        }
    }

    /// 是否为通配（any）IP 地址。
    pub fn is_unspecified_ip(&self) -> bool {
        matches!(self, Endpoint::Ip(addr) if addr.ip().is_unspecified())
    }

    /// 通配地址替换为同族回环地址，其余地址原样返回。
    ///
    /// 与绑定在 any 上的监听器保持对称：连接 `0.0.0.0:p` 等价于连接 `127.0.0.1:p`。
    pub fn loopback_for_unspecified(&self) -> Endpoint {
        match self {
            Endpoint::Ip(addr) if addr.ip().is_unspecified() => {
                let loopback = match addr.ip() {
                    IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                    IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
                };
                Endpoint::Ip(SocketAddr::new(loopback, addr.port()))
            }
            other => other.clone(),
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Endpoint::Ip(addr)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Ip(addr) => write!(f, "{addr}"),
            Endpoint::Named(name) => write!(f, "memory://{name}"),
            Endpoint::Anonymous(id) => write!(f, "memory://anonymous-{id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unspecified_addresses_map_to_loopback() {
        let v4: Endpoint = "0.0.0.0:8080".parse::<SocketAddr>().unwrap().into();
        assert!(v4.is_unspecified_ip());
        assert_eq!(
            v4.loopback_for_unspecified(),
            Endpoint::Ip("127.0.0.1:8080".parse().unwrap())
        );

        let v6: Endpoint = "[::]:9000".parse::<SocketAddr>().unwrap().into();
        assert_eq!(
            v6.loopback_for_unspecified(),
            Endpoint::Ip("[::1]:9000".parse().unwrap())
        );

        let named = Endpoint::named("svc");
        assert!(!named.is_unspecified_ip());
        assert_eq!(named.loopback_for_unspecified(), named);
        assert_eq!(named.to_string(), "memory://svc");
    }
}
