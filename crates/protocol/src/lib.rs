use std::fmt::Display;

use derive_more::derive::{Deref, Display as DeriveDisplay, From};

pub mod key;
pub mod request;
pub mod stream;

/// Global request asking the server to listen on the client's behalf.
pub const REQUEST_REVERSE_FORWARD: &str = "tcpip-forward";
/// Global request asking the server to stop a previous reverse forward.
pub const REQUEST_CANCEL_REVERSE_FORWARD: &str = "cancel-tcpip-forward";
/// Channel type the client opens to reach a destination through the server.
pub const CHANNEL_OUTBOUND_CONNECT: &str = "direct-tcpip";
/// Channel type the server opens for each connection accepted on a reverse listener.
pub const CHANNEL_FORWARDED_CONNECTION: &str = "forwarded-tcpip";

/// Identity of one SSH connection inside the server, used for logs only.
#[derive(Debug, Hash, DeriveDisplay, PartialEq, Eq, From, Deref, Clone, Copy)]
#[display("conn-{_0:04x}")]
pub struct SessionId(u64);

/// Registry key of one reverse forward.
///
/// `bind_port` is the port the listener actually bound, so a registration made with port 0
/// is cancelled with the allocated port.
#[derive(Debug, Hash, PartialEq, Eq, Clone)]
pub struct ForwardKey {
    pub bind_addr: String,
    pub bind_port: u32,
}

impl ForwardKey {
    pub fn new(bind_addr: &str, bind_port: u32) -> Self {
        Self {
            bind_addr: bind_addr.to_string(),
            bind_port,
        }
    }
}

impl Display for ForwardKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{}:{}", self.bind_addr, self.bind_port))
    }
}

/// Map the bind address a client sends to something the OS can bind.
///
/// An empty address and `*` both mean every interface.
pub fn listen_host(bind_addr: &str) -> &str {
    match bind_addr {
        "" | "*" => "0.0.0.0",
        "localhost" => "127.0.0.1",
        other => other,
    }
}
