use std::net::SocketAddr;

use crate::ForwardKey;

/// Reason a channel-open request was refused, with its RFC 4254 code.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RejectReason {
    #[error("administratively prohibited: {0}")]
    Prohibited(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("unknown channel type {0}")]
    UnknownChannelType(String),
    #[error("resource shortage: {0}")]
    ResourceShortage(String),
}

impl RejectReason {
    pub fn code(&self) -> u32 {
        match self {
            RejectReason::Prohibited(_) | RejectReason::InvalidPayload(_) => 1,
            RejectReason::ConnectFailed(_) => 2,
            RejectReason::UnknownChannelType(_) => 3,
            RejectReason::ResourceShortage(_) => 4,
        }
    }
}

fn checked_port(port: u32) -> Result<u16, RejectReason> {
    u16::try_from(port).map_err(|_| RejectReason::InvalidPayload(format!("port {port} out of range")))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReverseForwardRequest {
    pub bind_addr: String,
    pub bind_port: u32,
}

impl ReverseForwardRequest {
    pub fn port(&self) -> Result<u16, RejectReason> {
        checked_port(self.bind_port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReverseForwardReply {
    pub bound_port: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelReverseForwardRequest {
    pub bind_addr: String,
    pub bind_port: u32,
}

impl CancelReverseForwardRequest {
    pub fn key(&self) -> ForwardKey {
        ForwardKey::new(&self.bind_addr, self.bind_port)
    }
}

/// Payload of a `forwarded-tcpip` channel the server opens towards the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardedConnectionOpen {
    pub connected_addr: String,
    pub connected_port: u32,
    pub origin_addr: String,
    pub origin_port: u32,
}

impl ForwardedConnectionOpen {
    pub fn new(listener: SocketAddr, remote: SocketAddr) -> Self {
        Self {
            connected_addr: listener.ip().to_string(),
            connected_port: listener.port() as u32,
            origin_addr: remote.ip().to_string(),
            origin_port: remote.port() as u32,
        }
    }
}

/// Payload of a `direct-tcpip` channel the client opens towards the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundConnectRequest {
    pub dest_addr: String,
    pub dest_port: u32,
    pub origin_addr: String,
    pub origin_port: u32,
}

impl OutboundConnectRequest {
    /// Validated `(host, port)` pair to dial.
    pub fn destination(&self) -> Result<(&str, u16), RejectReason> {
        if self.dest_addr.is_empty() {
            return Err(RejectReason::InvalidPayload("empty destination address".to_string()));
        }
        Ok((self.dest_addr.as_str(), checked_port(self.dest_port)?))
    }
}
