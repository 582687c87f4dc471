use std::{net::SocketAddr, sync::Arc, time::Duration};

use metrics::{counter, gauge};
use protocol::{key::KeyAuthorizer, SessionId};
use russh::keys::{PrivateKey, PublicKey};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{OwnedSemaphorePermit, Semaphore},
};

use crate::{
    handler::{ConnectionOptions, TunnelHandler},
    metrics::{METRICS_SSH_CONN_COUNT, METRICS_SSH_CONN_LIVE, METRICS_SSH_HANDSHAKE_ERROR_COUNT},
};

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Optional caps, all unlimited by default.
#[derive(Debug, Clone, Copy, Default)]
pub struct TunnelLimits {
    pub max_connections: Option<usize>,
    pub max_channels_per_connection: Option<usize>,
    pub max_forwards_per_connection: Option<usize>,
}

pub struct TunnelServerConfig<A> {
    pub listen_addr: SocketAddr,
    pub host_key: PrivateKey,
    pub authorizer: A,
    pub dial_timeout: Option<Duration>,
    pub inactivity_timeout: Option<Duration>,
    pub socks_route_host: Option<String>,
    pub limits: TunnelLimits,
}

/// Accepts raw TCP connections and runs one SSH session per connection.
pub struct TunnelServer<A> {
    listener: TcpListener,
    ssh_config: Arc<russh::server::Config>,
    authorizer: A,
    options: ConnectionOptions,
    conn_quota: Option<Arc<Semaphore>>,
}

impl<A: KeyAuthorizer<PublicKey>> TunnelServer<A> {
    pub async fn new(cfg: TunnelServerConfig<A>) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(cfg.listen_addr).await?;
        log::info!("[TunnelServer] listening on {}", listener.local_addr()?);
        let ssh_config = russh::server::Config {
            keys: vec![cfg.host_key],
            inactivity_timeout: cfg.inactivity_timeout,
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            ..Default::default()
        };
        Ok(Self {
            listener,
            ssh_config: Arc::new(ssh_config),
            authorizer: cfg.authorizer,
            options: ConnectionOptions {
                dial_timeout: cfg.dial_timeout,
                max_channels: cfg.limits.max_channels_per_connection,
                max_forwards: cfg.limits.max_forwards_per_connection,
                socks_route_host: cfg.socks_route_host,
            },
            conn_quota: cfg.limits.max_connections.map(|max| Arc::new(Semaphore::new(max))),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept one connection and spawn its session. Accept errors are logged and never end the server.
    pub async fn recv(&mut self) -> anyhow::Result<()> {
        let permit = match &self.conn_quota {
            Some(quota) => Some(quota.clone().acquire_owned().await?),
            None => None,
        };
        match self.listener.accept().await {
            Ok((stream, remote)) => {
                let session_id = SessionId::from(rand::random::<u64>());
                let handler = TunnelHandler::new(session_id, Some(remote), self.authorizer.clone(), &self.options);
                tokio::spawn(run_connection(session_id, remote, stream, self.ssh_config.clone(), handler, permit));
            }
            Err(e) => {
                log::error!("[TunnelServer] accept error {e}");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
        Ok(())
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        loop {
            self.recv().await?;
        }
    }
}

async fn run_connection<A: KeyAuthorizer<PublicKey>>(
    session_id: SessionId,
    remote: SocketAddr,
    stream: TcpStream,
    ssh_config: Arc<russh::server::Config>,
    handler: TunnelHandler<A>,
    _permit: Option<OwnedSemaphorePermit>,
) {
    counter!(METRICS_SSH_CONN_COUNT).increment(1);
    gauge!(METRICS_SSH_CONN_LIVE).increment(1.0);
    log::info!("[TunnelServer] {session_id} new connection from {remote}");
    match russh::server::run_stream(ssh_config, stream, handler).await {
        Ok(session) => match session.await {
            Ok(()) => log::info!("[TunnelServer] {session_id} from {remote} closed"),
            Err(e) => log::warn!("[TunnelServer] {session_id} from {remote} ended with error {e}"),
        },
        Err(e) => {
            counter!(METRICS_SSH_HANDSHAKE_ERROR_COUNT).increment(1);
            log::warn!("[TunnelServer] {session_id} handshake with {remote} failed {e}");
        }
    }
    gauge!(METRICS_SSH_CONN_LIVE).decrement(1.0);
}
