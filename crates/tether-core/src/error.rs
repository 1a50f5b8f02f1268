//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为所有传输实现与装饰器提供唯一的错误域 [`ConnectionError`]，调用方只需匹配
//!   [`ErrorKind`] 即可区分“监听器已关闭”“本次调用被取消”“底层传输失败”等语义；
//! - 稳定错误码（`tether.<层>.<原因>`）用于日志与告警聚合，避免解析自然语言消息。
//!
//! ## 设计要求（What）
//! - 各 crate 以 [`OperationKind`] 常量描述自身操作，并统一经由 [`map_io_error`]
//!   将 `io::Error` 归类；
//! - 装饰器不得吞掉被包装对象返回的错误，只允许在传播前释放自身获取的资源。

use std::{borrow::Cow, error::Error as StdError, fmt, io};

use thiserror::Error;

/// 错误的主分类，调用方据此决定重试、降级或放弃。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// 地址缺失、格式错误或不被当前传输支持。
    Address,
    /// 地址已被其他监听器占用。
    AddressInUse,
    /// 底层传输（OS 套接字、内存管道）失败，可能携带原生错误码。
    Connectivity,
    /// 调用方通过取消令牌终止了本次操作。
    Cancelled,
    /// 能力或刷新模式不被当前传输支持。
    Unsupported,
    /// TLS 握手失败。
    Handshake,
    /// 对象已被释放。
    Disposed,
    /// 能力包中缺少必需的配置项。
    Configuration,
    /// 操作与对象当前状态冲突（例如写方向关闭后继续写入）。
    InvalidState,
}

impl ErrorKind {
    /// 返回稳定的小写名称，用于结构化日志字段。
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Address => "address",
            ErrorKind::AddressInUse => "address_in_use",
            ErrorKind::Connectivity => "connectivity",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Handshake => "handshake",
            ErrorKind::Disposed => "disposed",
            ErrorKind::Configuration => "configuration",
            ErrorKind::InvalidState => "invalid_state",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type BoxedCause = Box<dyn StdError + Send + Sync + 'static>;

/// 连接抽象层的统一错误类型。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把 OS、TLS 库与内存管道产生的异构错误收敛为一个可跨线程传递的结构，
///   让协议层只依赖本 crate 即可完成错误处置；
/// - 保留原始 `source` 链，排障时仍可追溯到 errno 或 rustls 告警。
///
/// ## 契约（What）
/// - `kind`：主分类，决定调用方的处置策略；
/// - `code`：稳定错误码，遵循 `tether.<层>.<原因>`；
/// - `message`：面向排障人员的描述；
/// - `source`：可选底层原因，通过 [`std::error::Error::source`] 暴露。
///
/// ## 注意事项（Trade-offs）
/// - 消息使用 `Cow<'static, str>`，静态文案零分配，动态文案才会占用堆；
/// - 原生错误码只在 `source` 为 `io::Error` 时可用，见 [`ConnectionError::raw_os_error`]。
#[derive(Debug, Error)]
#[error("{message} [{code}]")]
pub struct ConnectionError {
    kind: ErrorKind,
    code: &'static str,
    message: Cow<'static, str>,
    #[source]
    source: Option<BoxedCause>,
}

impl ConnectionError {
    /// 构造错误。
    pub fn new(kind: ErrorKind, code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
            source: None,
        }
    }

    /// 附带底层原因。
    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// 附带已装箱的底层原因。
    pub fn with_boxed_source(mut self, source: BoxedCause) -> Self {
        self.source = Some(source);
        self
    }

    /// 主分类。
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// 描述文本。
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 判断是否属于指定分类。
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    /// 返回被包装的原生错误码（若底层原因是携带 errno 的 `io::Error`）。
    pub fn raw_os_error(&self) -> Option<i32> {
        let mut current: Option<&(dyn StdError + 'static)> =
            self.source.as_deref().map(|err| err as &(dyn StdError + 'static));
        while let Some(err) = current {
            if let Some(io_err) = err.downcast_ref::<io::Error>()
                && let Some(code) = io_err.raw_os_error()
            {
                return Some(code);
            }
            current = err.source();
        }
        None
    }

    /// 构造“已释放”错误。
    pub fn disposed(object: &'static str) -> Self {
        Self::new(
            ErrorKind::Disposed,
            codes::DISPOSED,
            format!("{object} has been disposed"),
        )
    }

    /// 构造取消错误。
    pub fn cancelled(kind: OperationKind) -> Self {
        Self::new(
            ErrorKind::Cancelled,
            codes::CANCELLED,
            format!("{} cancelled", kind.message),
        )
    }

    /// 构造不支持错误。
    pub fn unsupported(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Unsupported, code, message)
    }

    /// 构造缺失配置错误。
    pub fn missing_property<T: ?Sized>() -> Self {
        Self::new(
            ErrorKind::Configuration,
            codes::MISSING_PROPERTY,
            format!(
                "required connection property `{}` is missing",
                std::any::type_name::<T>()
            ),
        )
    }
}

/// 核心层共享的稳定错误码。
pub mod codes {
    /// 对象已释放。
    pub const DISPOSED: &str = "tether.core.disposed";
    /// 操作被取消。
    pub const CANCELLED: &str = "tether.core.cancelled";
    /// 能力包已冻结。
    pub const PROPERTIES_FROZEN: &str = "tether.core.properties_frozen";
    /// 能力包缺少必需项。
    pub const MISSING_PROPERTY: &str = "tether.core.missing_property";
    /// 底层流不支持半关闭。
    pub const SHUTDOWN_UNSUPPORTED: &str = "tether.core.shutdown_unsupported";
    /// 写方向已关闭。
    pub const WRITES_SHUT_DOWN: &str = "tether.core.writes_shut_down";
}

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

impl OperationKind {
    /// 声明一个操作种类。
    pub const fn new(code: &'static str, message: &'static str) -> Self {
        Self { code, message }
    }
}

/// 将 IO 错误映射为 [`ConnectionError`]，并依据 `io::ErrorKind` 推导主分类。
pub fn map_io_error(kind: OperationKind, error: io::Error) -> ConnectionError {
    let category = categorize_io_error(&error);
    ConnectionError::new(category, kind.code, format!("{}: {}", kind.message, error))
        .with_source(error)
}

fn categorize_io_error(error: &io::Error) -> ErrorKind {
    use io::ErrorKind as Io;
    match error.kind() {
        Io::AddrInUse => ErrorKind::AddressInUse,
        Io::AddrNotAvailable | Io::InvalidInput => ErrorKind::Address,
        Io::Unsupported => ErrorKind::Unsupported,
        _ => ErrorKind::Connectivity,
    }
}

/// 连接抽象层统一的返回别名。
pub type Result<T, E = ConnectionError> = core::result::Result<T, E>;
