use std::{fmt::Display, future::Future, net::SocketAddr};

use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};

/// Endpoint address of a tunnel stream. SSH channels have no socket address of their own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnAddr {
    Socket(SocketAddr),
    Named(&'static str),
}

impl Display for ConnAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnAddr::Socket(addr) => addr.fmt(f),
            ConnAddr::Named(name) => f.write_str(name),
        }
    }
}

/// Whether read/write deadlines can be enforced on a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineSupport {
    Supported,
    Unsupported,
}

/// A bidirectional byte stream that can take part in a bridge.
pub trait TunnelConn: AsyncRead + AsyncWrite + Unpin + Send {
    fn local_addr(&self) -> ConnAddr;
    fn peer_addr(&self) -> ConnAddr;

    /// Callers that want timeouts must check this first.
    fn deadline_support(&self) -> DeadlineSupport;

    /// Release the stream. Calling this on an already closed stream is harmless.
    fn close(self) -> impl Future<Output = ()> + Send
    where
        Self: Sized,
    {
        async move {
            let mut conn = self;
            if let Err(e) = conn.shutdown().await {
                log::debug!("[TunnelConn] shutdown on close error {e}");
            }
        }
    }
}

impl TunnelConn for TcpStream {
    fn local_addr(&self) -> ConnAddr {
        match TcpStream::local_addr(self) {
            Ok(addr) => ConnAddr::Socket(addr),
            Err(_) => ConnAddr::Named("tcp-local"),
        }
    }

    fn peer_addr(&self) -> ConnAddr {
        match TcpStream::peer_addr(self) {
            Ok(addr) => ConnAddr::Socket(addr),
            Err(_) => ConnAddr::Named("tcp-remote"),
        }
    }

    fn deadline_support(&self) -> DeadlineSupport {
        DeadlineSupport::Supported
    }
}
