use tether_core::OperationKind;

pub(crate) const CONNECT: OperationKind =
    OperationKind::new("tether.memory.connect_failed", "memory connect");
pub(crate) const LISTEN: OperationKind =
    OperationKind::new("tether.memory.listen_failed", "memory listen");
pub(crate) const ACCEPT: OperationKind =
    OperationKind::new("tether.memory.accept_failed", "memory accept");
pub(crate) const READ: OperationKind =
    OperationKind::new("tether.memory.read_failed", "memory read");
pub(crate) const WRITE: OperationKind =
    OperationKind::new("tether.memory.write_failed", "memory write");
pub(crate) const FLUSH: OperationKind =
    OperationKind::new("tether.memory.flush_failed", "memory flush");

/// 目标地址没有注册监听器。
pub const CONNECTION_REFUSED: &str = "tether.memory.connection_refused";
/// 监听器在请求被接入前关闭。
pub const LISTENER_CLOSED: &str = "tether.memory.listener_closed";
/// 对端已关闭读方向。
pub const BROKEN_PIPE: &str = "tether.memory.broken_pipe";
/// 地址已被占用。
pub const ADDRESS_IN_USE: &str = "tether.memory.address_in_use";
