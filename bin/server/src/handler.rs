use std::{net::SocketAddr, time::Duration};

use metrics::counter;
use protocol::{
    key::KeyAuthorizer,
    request::{CancelReverseForwardRequest, OutboundConnectRequest, RejectReason, ReverseForwardRequest},
    SessionId, CHANNEL_OUTBOUND_CONNECT, REQUEST_CANCEL_REVERSE_FORWARD, REQUEST_REVERSE_FORWARD,
};
use russh::{
    keys::PublicKey,
    server::{Auth, Handle, Handler, Msg, Session},
    Channel, MethodKind, MethodSet,
};

use crate::{
    channel_conn::ChannelConn,
    metrics::{METRICS_OUTBOUND_REJECT_COUNT, METRICS_SSH_AUTH_REJECT_COUNT},
    outbound::OutboundForwarder,
    reverse::ReverseForwardManager,
    socks::serve_socks,
};

/// Per-connection knobs, shared by every connection of a server.
#[derive(Debug, Clone, Default)]
pub struct ConnectionOptions {
    pub dial_timeout: Option<Duration>,
    pub max_channels: Option<usize>,
    pub max_forwards: Option<usize>,
    /// `direct-tcpip` requests to this host are served by the embedded SOCKS5 engine. Off when `None`.
    pub socks_route_host: Option<String>,
}

/// Routes one SSH connection's requests: public key auth, `direct-tcpip` channels and `tcpip-forward` requests.
/// Everything else (sessions, x11, streamlocal) is refused.
pub struct TunnelHandler<A> {
    session_id: SessionId,
    peer: Option<SocketAddr>,
    authorizer: A,
    outbound: OutboundForwarder,
    socks_route_host: Option<String>,
    max_forwards: Option<usize>,
    reverse: Option<ReverseForwardManager<Handle>>,
}

impl<A: KeyAuthorizer<PublicKey>> TunnelHandler<A> {
    pub fn new(session_id: SessionId, peer: Option<SocketAddr>, authorizer: A, options: &ConnectionOptions) -> Self {
        Self {
            session_id,
            peer,
            authorizer,
            outbound: OutboundForwarder::new(options.dial_timeout, options.max_channels),
            socks_route_host: options.socks_route_host.clone(),
            max_forwards: options.max_forwards,
            reverse: None,
        }
    }

    fn reverse(&mut self, session: &Session) -> &ReverseForwardManager<Handle> {
        let (session_id, max_forwards) = (self.session_id, self.max_forwards);
        self.reverse.get_or_insert_with(|| ReverseForwardManager::new(session_id, session.handle(), max_forwards))
    }

    fn open_socks(&self, channel: Channel<Msg>, session: &Session) -> bool {
        let permit = match self.outbound.reserve() {
            Ok(permit) => permit,
            Err(reason) => {
                self.log_reject("socks", &reason);
                return false;
            }
        };
        let conn = ChannelConn::new(channel, session.handle());
        let outbound = self.outbound.clone();
        let session_id = self.session_id;
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = serve_socks(conn, outbound).await {
                log::warn!("[TunnelHandler {session_id}] socks channel error {e}");
            }
        });
        true
    }

    fn log_reject(&self, what: &str, reason: &RejectReason) {
        counter!(METRICS_OUTBOUND_REJECT_COUNT).increment(1);
        log::warn!("[TunnelHandler {}] reject {what} channel, code {} {reason}", self.session_id, reason.code());
    }
}

fn publickey_only() -> Auth {
    Auth::Reject {
        proceed_with_methods: Some(MethodSet::from(&[MethodKind::PublicKey][..])),
        partial_success: false,
    }
}

impl<A: KeyAuthorizer<PublicKey>> Handler for TunnelHandler<A> {
    type Error = anyhow::Error;

    async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
        Ok(publickey_only())
    }

    async fn auth_password(&mut self, user: &str, _password: &str) -> Result<Auth, Self::Error> {
        log::warn!("[TunnelHandler {}] password auth attempt for {user} refused", self.session_id);
        Ok(publickey_only())
    }

    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        if self.authorizer.authorize(user, key) {
            log::info!("[TunnelHandler {}] {user} from {:?} authenticated with {}", self.session_id, self.peer, key.algorithm());
            Ok(Auth::Accept)
        } else {
            counter!(METRICS_SSH_AUTH_REJECT_COUNT).increment(1);
            Ok(publickey_only())
        }
    }

    async fn channel_open_session(&mut self, _channel: Channel<Msg>, _session: &mut Session) -> Result<bool, Self::Error> {
        self.log_reject("session", &RejectReason::UnknownChannelType("session".to_string()));
        Ok(false)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.socks_route_host.as_deref() == Some(host_to_connect) {
            log::info!("[TunnelHandler {}] {CHANNEL_OUTBOUND_CONNECT} to {host_to_connect} served as socks", self.session_id);
            return Ok(self.open_socks(channel, session));
        }

        let req = OutboundConnectRequest {
            dest_addr: host_to_connect.to_string(),
            dest_port: port_to_connect,
            origin_addr: originator_address.to_string(),
            origin_port: originator_port,
        };
        match self.outbound.accept(&req) {
            Ok(pending) => {
                log::info!("[TunnelHandler {}] {CHANNEL_OUTBOUND_CONNECT} {} accepted", self.session_id, pending.label());
                pending.spawn(ChannelConn::new(channel, session.handle()));
                Ok(true)
            }
            Err(reason) => {
                self.log_reject(CHANNEL_OUTBOUND_CONNECT, &reason);
                Ok(false)
            }
        }
    }

    async fn tcpip_forward(&mut self, address: &str, port: &mut u32, session: &mut Session) -> Result<bool, Self::Error> {
        let req = ReverseForwardRequest {
            bind_addr: address.to_string(),
            bind_port: *port,
        };
        let session_id = self.session_id;
        match self.reverse(session).register(&req).await {
            Ok(reply) => {
                *port = reply.bound_port;
                Ok(true)
            }
            Err(e) => {
                log::warn!("[TunnelHandler {session_id}] {REQUEST_REVERSE_FORWARD} {address}:{} failed {e}", req.bind_port);
                Ok(false)
            }
        }
    }

    async fn cancel_tcpip_forward(&mut self, address: &str, port: u32, _session: &mut Session) -> Result<bool, Self::Error> {
        let req = CancelReverseForwardRequest {
            bind_addr: address.to_string(),
            bind_port: port,
        };
        match &self.reverse {
            Some(manager) => Ok(manager.cancel(&req).await),
            None => {
                log::info!("[TunnelHandler {}] {REQUEST_CANCEL_REVERSE_FORWARD} {address}:{port} without any forward", self.session_id);
                Ok(true)
            }
        }
    }
}

impl<A> Drop for TunnelHandler<A> {
    fn drop(&mut self) {
        if let Some(manager) = self.reverse.take() {
            let closed = manager.close_all();
            log::info!("[TunnelHandler {}] connection closed, stopped {closed} reverse listeners", self.session_id);
        }
    }
}
