use tether_core::OperationKind;

pub(crate) const READ: OperationKind = OperationKind::new("tether.filters.read_failed", "filter read");
pub(crate) const WRITE: OperationKind =
    OperationKind::new("tether.filters.write_failed", "filter write");
pub(crate) const FLUSH: OperationKind =
    OperationKind::new("tether.filters.flush_failed", "filter flush");

/// 写缓冲容量为 0。
pub const INVALID_CAPACITY: &str = "tether.filters.invalid_capacity";
/// 分片序列为空或包含 0。
pub const INVALID_SEQUENCE: &str = "tether.filters.invalid_sequence";
