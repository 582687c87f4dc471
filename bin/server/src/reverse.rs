use std::{future::Future, net::SocketAddr};

use anyhow::anyhow;
use metrics::{counter, gauge};
use protocol::{
    listen_host,
    request::{CancelReverseForwardRequest, ForwardedConnectionOpen, ReverseForwardReply, ReverseForwardRequest},
    stream::TunnelConn,
    ForwardKey, SessionId, CHANNEL_FORWARDED_CONNECTION,
};
use russh::server::Handle;
use tokio::net::{TcpListener, TcpStream};

use crate::{
    bridge::bridge,
    channel_conn::ChannelConn,
    metrics::{METRICS_BRIDGE_BYTES, METRICS_REVERSE_CONN_COUNT, METRICS_REVERSE_CONN_LIVE, METRICS_REVERSE_LISTENER_LIVE, METRICS_REVERSE_OPEN_ERROR_COUNT},
};

mod registry;

pub use registry::{ForwardRegistry, ListenerHandle, ListenerId, ListenerSignal};

/// Opens the `forwarded-tcpip` channel for one accepted connection.
pub trait ForwardedChannelOpener: Clone + Send + Sync + 'static {
    type Conn: TunnelConn + 'static;

    fn open_forwarded(&self, open: ForwardedConnectionOpen) -> impl Future<Output = anyhow::Result<Self::Conn>> + Send;
}

impl ForwardedChannelOpener for Handle {
    type Conn = ChannelConn;

    fn open_forwarded(&self, open: ForwardedConnectionOpen) -> impl Future<Output = anyhow::Result<Self::Conn>> + Send {
        async move {
            let channel = self
                .channel_open_forwarded_tcpip(open.connected_addr, open.connected_port, open.origin_addr, open.origin_port)
                .await?;
            Ok(ChannelConn::new(channel, self.clone()))
        }
    }
}

/// Reverse forwards of one SSH connection.
#[derive(Clone)]
pub struct ReverseForwardManager<O> {
    session: SessionId,
    opener: O,
    registry: ForwardRegistry,
    max_forwards: Option<usize>,
}

impl<O: ForwardedChannelOpener> ReverseForwardManager<O> {
    pub fn new(session: SessionId, opener: O, max_forwards: Option<usize>) -> Self {
        Self {
            session,
            opener,
            registry: ForwardRegistry::default(),
            max_forwards,
        }
    }

    pub fn registry(&self) -> &ForwardRegistry {
        &self.registry
    }

    /// Bind the requested address and start accepting. Nothing is registered when binding fails.
    pub async fn register(&self, req: &ReverseForwardRequest) -> anyhow::Result<ReverseForwardReply> {
        let port = req.port()?;
        if let Some(max) = self.max_forwards {
            if self.registry.len() >= max {
                return Err(anyhow!("forward limit {max} reached"));
            }
        }

        let listener = TcpListener::bind((listen_host(&req.bind_addr), port)).await?;
        let local_addr = listener.local_addr()?;
        let key = ForwardKey::new(&req.bind_addr, local_addr.port() as u32);
        let id = ListenerId::random();
        let (handle, signal) = ListenerHandle::pair();
        if let Some(old) = self.registry.register(key.clone(), id, handle) {
            old.close().await;
        }
        log::info!("[ReverseForward {}] listening {key} on {local_addr}", self.session);
        tokio::spawn(run_listener(self.session, listener, local_addr, key, id, self.registry.clone(), self.opener.clone(), signal));

        Ok(ReverseForwardReply {
            bound_port: local_addr.port() as u32,
        })
    }

    /// Stop a forward. Unknown keys are not an error; once this returns the port no longer accepts.
    pub async fn cancel(&self, req: &CancelReverseForwardRequest) -> bool {
        let key = req.key();
        match self.registry.unregister(&key) {
            Some(handle) => {
                handle.close().await;
                log::info!("[ReverseForward {}] cancelled {key}", self.session);
            }
            None => {
                log::info!("[ReverseForward {}] cancel {key} not registered", self.session);
            }
        }
        true
    }

    /// Stop every listener of this connection without waiting for the sockets.
    pub fn close_all(&self) -> usize {
        let listeners = self.registry.drain();
        for (key, _handle) in &listeners {
            log::info!("[ReverseForward {}] closing {key} with connection", self.session);
        }
        listeners.len()
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_listener<O: ForwardedChannelOpener>(
    session: SessionId,
    listener: TcpListener,
    local_addr: SocketAddr,
    key: ForwardKey,
    id: ListenerId,
    registry: ForwardRegistry,
    opener: O,
    signal: ListenerSignal,
) {
    gauge!(METRICS_REVERSE_LISTENER_LIVE).increment(1.0);
    let ListenerSignal { mut close_rx, done_tx } = signal;
    loop {
        tokio::select! {
            _ = &mut close_rx => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    log::info!("[ReverseForward {session}] {key} accepted {remote}");
                    tokio::spawn(relay_forwarded(session, opener.clone(), stream, local_addr, remote));
                }
                Err(e) => {
                    log::warn!("[ReverseForward {session}] {key} accept error {e}");
                    break;
                }
            }
        }
    }
    drop(listener);
    registry.unregister_if(&key, id);
    let _ = done_tx.send(());
    gauge!(METRICS_REVERSE_LISTENER_LIVE).decrement(1.0);
    log::info!("[ReverseForward {session}] {key} listener stopped");
}

async fn relay_forwarded<O: ForwardedChannelOpener>(session: SessionId, opener: O, mut stream: TcpStream, listener_addr: SocketAddr, remote: SocketAddr) {
    // a wildcard listener reports the address the connection actually reached
    let connected = stream.local_addr().unwrap_or(listener_addr);
    let mut channel = match opener.open_forwarded(ForwardedConnectionOpen::new(connected, remote)).await {
        Ok(channel) => channel,
        Err(e) => {
            counter!(METRICS_REVERSE_OPEN_ERROR_COUNT).increment(1);
            log::warn!("[ReverseForward {session}] open {CHANNEL_FORWARDED_CONNECTION} for {remote} failed {e}");
            stream.close().await;
            return;
        }
    };

    counter!(METRICS_REVERSE_CONN_COUNT).increment(1);
    gauge!(METRICS_REVERSE_CONN_LIVE).increment(1.0);
    let stats = bridge(&mut stream, &mut channel).await;
    if let Some(e) = &stats.first_error {
        log::debug!("[ReverseForward {session}] {remote} ended with {e}");
    }
    log::info!("[ReverseForward {session}] {remote} done, up {} bytes, down {} bytes", stats.a_to_b, stats.b_to_a);
    counter!(METRICS_BRIDGE_BYTES).increment(stats.a_to_b + stats.b_to_a);
    stream.close().await;
    channel.close().await;
    gauge!(METRICS_REVERSE_CONN_LIVE).decrement(1.0);
}
