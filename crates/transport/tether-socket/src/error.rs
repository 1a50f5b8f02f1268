use tether_core::OperationKind;

pub(crate) const CONNECT: OperationKind =
    OperationKind::new("tether.socket.connect_failed", "socket connect");
pub(crate) const BIND: OperationKind =
    OperationKind::new("tether.socket.bind_failed", "socket bind");
pub(crate) const ACCEPT: OperationKind =
    OperationKind::new("tether.socket.accept_failed", "socket accept");
pub(crate) const READ: OperationKind =
    OperationKind::new("tether.socket.read_failed", "socket read");
pub(crate) const WRITE: OperationKind =
    OperationKind::new("tether.socket.write_failed", "socket write");
pub(crate) const SHUTDOWN: OperationKind =
    OperationKind::new("tether.socket.shutdown_failed", "socket shutdown");
pub(crate) const CONFIGURE: OperationKind =
    OperationKind::new("tether.socket.configure_failed", "socket configure");

/// 端点不是 IP 地址。
pub const UNSUPPORTED_ENDPOINT: &str = "tether.socket.unsupported_endpoint";
/// 目标地址族与工厂配置不符。
pub const FAMILY_MISMATCH: &str = "tether.socket.family_mismatch";
