use rustls::{CipherSuite, CommonState, ProtocolVersion};
use rustls_pki_types::ServerName;

/// 会话所处的一端。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlsSide {
    Client,
    Server,
}

/// 握手完成后发布到连接能力中的会话信息。
///
/// 通过 `connection.try_get_property::<TlsSessionInfo>()` 查询；未启用 TLS 的连接返回 `None`。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsSessionInfo {
    side: TlsSide,
    protocol_version: Option<ProtocolVersion>,
    cipher_suite: Option<CipherSuite>,
    alpn_protocol: Option<Vec<u8>>,
    server_name: Option<String>,
    peer_certificates: usize,
}

impl TlsSessionInfo {
    pub(crate) fn capture(side: TlsSide, state: &CommonState, server_name: Option<String>) -> Self {
        Self {
            side,
            protocol_version: state.protocol_version(),
            cipher_suite: state
                .negotiated_cipher_suite()
                .map(|suite| suite.suite()),
            alpn_protocol: state.alpn_protocol().map(<[u8]>::to_vec),
            server_name,
            peer_certificates: state.peer_certificates().map_or(0, <[_]>::len),
        }
    }

    pub fn side(&self) -> TlsSide {
        self.side
    }

    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.protocol_version
    }

    pub fn cipher_suite(&self) -> Option<CipherSuite> {
        self.cipher_suite
    }

    /// 协商出的 ALPN 协议。
    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        self.alpn_protocol.as_deref()
    }

    /// 客户端为连接时使用的名称，服务端为收到的 SNI。
    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    /// 对端出示的证书链长度。
    pub fn peer_certificates(&self) -> usize {
        self.peer_certificates
    }
}

pub(crate) fn server_name_text(name: &ServerName<'_>) -> Option<String> {
    match name {
        ServerName::DnsName(dns) => Some(dns.as_ref().to_owned()),
        ServerName::IpAddress(ip) => Some(std::net::IpAddr::from(*ip).to_string()),
        _ => None,
    }
}
