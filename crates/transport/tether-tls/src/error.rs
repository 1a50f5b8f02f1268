//! TLS 错误映射。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 握手与记录层失败统一归入 [`ErrorKind::Handshake`] 或 [`ErrorKind::Connectivity`]，
//!   调用方无需理解 rustls 的错误枚举；
//! - 底层传输的错误经由 IO 适配层穿透到 rustls 再返回时，必须原样恢复其分类与原生错误码。
//!
//! ## 逻辑（How）
//! - 适配层以 `io::Error::other(ConnectionError)` 把传输错误送入 rustls；
//!   [`map_tls_error`] 先尝试取回这一原始错误，再检查是否嵌套 `rustls::Error`，
//!   最后回落到 [`map_io_error`]；
//! - 证书、告警与协议违规类的 rustls 错误无论发生在哪个阶段都视为握手失败。
//!
//! ## 注意事项（Trade-offs）
//! - 握手阶段对端直接断开（`UnexpectedEof`）通常意味着对端拒绝了本端的证书或参数，
//!   同样归为握手失败。

use std::io;

use rustls::{AlertDescription, Error as RustlsError};
use tether_core::{ConnectionError, ErrorKind, OperationKind, map_io_error};

pub(crate) const HANDSHAKE: OperationKind =
    OperationKind::new("tether.tls.handshake_failed", "tls handshake");
pub(crate) const READ: OperationKind = OperationKind::new("tether.tls.read_failed", "tls read");
pub(crate) const WRITE: OperationKind = OperationKind::new("tether.tls.write_failed", "tls write");
pub(crate) const FLUSH: OperationKind = OperationKind::new("tether.tls.flush_failed", "tls flush");
pub(crate) const SHUTDOWN: OperationKind =
    OperationKind::new("tether.tls.shutdown_failed", "tls shutdown");

/// 服务器名称无法解析为 SNI。
pub const INVALID_SERVER_NAME: &str = "tether.tls.invalid_server_name";

/// 将 TLS 会话返回的 `io::Error` 映射为 [`ConnectionError`]。
pub(crate) fn map_tls_error(kind: OperationKind, error: io::Error) -> ConnectionError {
    let tunnelled = error
        .get_ref()
        .is_some_and(|inner| inner.is::<ConnectionError>());
    if tunnelled {
        return match error.into_inner().map(|inner| inner.downcast::<ConnectionError>()) {
            Some(Ok(inner)) => *inner,
            Some(Err(other)) => {
                ConnectionError::new(ErrorKind::Connectivity, kind.code, kind.message)
                    .with_boxed_source(other)
            }
            None => ConnectionError::new(ErrorKind::Connectivity, kind.code, kind.message),
        };
    }

    if let Some(rustls_error) = error
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<RustlsError>())
    {
        let category = categorize_rustls_error(kind, rustls_error);
        return ConnectionError::new(
            category,
            kind.code,
            format!("{}: {}", kind.message, rustls_error),
        )
        .with_source(error);
    }

    if kind == HANDSHAKE && error.kind() == io::ErrorKind::UnexpectedEof {
        return ConnectionError::new(
            ErrorKind::Handshake,
            kind.code,
            format!("{}: peer closed the connection", kind.message),
        )
        .with_source(error);
    }
    map_io_error(kind, error)
}

/// 把传输错误封装为 `io::Error`，供 rustls 的 IO 层传递。
pub(crate) fn tunnel(error: ConnectionError) -> io::Error {
    io::Error::other(error)
}

fn categorize_rustls_error(kind: OperationKind, error: &RustlsError) -> ErrorKind {
    use RustlsError::*;
    match error {
        InappropriateMessage { .. }
        | InappropriateHandshakeMessage { .. }
        | InvalidMessage(_)
        | PeerMisbehaved(_)
        | PeerIncompatible(_)
        | NoCertificatesPresented
        | InvalidCertificate(_)
        | UnsupportedNameType
        | DecryptError
        | NoApplicationProtocol => ErrorKind::Handshake,
        AlertReceived(alert) => categorize_alert(kind, alert),
        _ if kind == HANDSHAKE => ErrorKind::Handshake,
        _ => ErrorKind::Connectivity,
    }
}

fn categorize_alert(kind: OperationKind, alert: &AlertDescription) -> ErrorKind {
    use AlertDescription::*;
    match alert {
        CloseNotify | UserCanceled if kind != HANDSHAKE => ErrorKind::Connectivity,
        _ => ErrorKind::Handshake,
    }
}
