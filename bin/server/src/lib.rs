mod bridge;
mod channel_conn;
mod dns;
mod docs;
mod handler;
mod metrics;
mod outbound;
mod reverse;
mod server;
mod socks;


pub use bridge::{bridge, BridgeStats};
pub use channel_conn::ChannelConn;
pub use dns::DnsRelay;
pub use docs::{run_document_server, DocumentServerConfig};
pub use handler::{ConnectionOptions, TunnelHandler};
pub use crate::metrics::*;
pub use outbound::{OutboundForwarder, OutboundTarget, PendingOutbound};
pub use reverse::{ForwardRegistry, ForwardedChannelOpener, ReverseForwardManager};
pub use server::{TunnelLimits, TunnelServer, TunnelServerConfig};
pub use socks::serve_socks;
