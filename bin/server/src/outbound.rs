use std::{
    io,
    sync::Arc,
    time::{Duration, Instant},
};

use metrics::{counter, gauge, histogram};
use protocol::{
    request::{OutboundConnectRequest, RejectReason},
    stream::TunnelConn,
};
use tokio::{
    net::TcpStream,
    sync::{OwnedSemaphorePermit, Semaphore},
    task::JoinHandle,
};

use crate::{
    bridge::bridge,
    metrics::{METRICS_BRIDGE_BYTES, METRICS_OUTBOUND_COUNT, METRICS_OUTBOUND_DIAL_HISTOGRAM, METRICS_OUTBOUND_LIVE, METRICS_OUTBOUND_REJECT_COUNT},
};

/// Handles `direct-tcpip` requests of one SSH connection: validate, dial, then bridge.
#[derive(Clone, Default)]
pub struct OutboundForwarder {
    dial_timeout: Option<Duration>,
    channel_quota: Option<Arc<Semaphore>>,
}

/// An accepted request whose destination is not dialed yet.
pub struct PendingOutbound {
    forwarder: OutboundForwarder,
    host: String,
    port: u16,
    label: String,
    permit: Option<OwnedSemaphorePermit>,
}

/// A dialed destination waiting for its channel.
pub struct OutboundTarget {
    stream: TcpStream,
    label: String,
    _permit: Option<OwnedSemaphorePermit>,
}

impl OutboundForwarder {
    pub fn new(dial_timeout: Option<Duration>, max_channels: Option<usize>) -> Self {
        Self {
            dial_timeout,
            channel_quota: max_channels.map(|max| Arc::new(Semaphore::new(max))),
        }
    }

    /// Take one channel slot, if channels are limited on this connection.
    pub fn reserve(&self) -> Result<Option<OwnedSemaphorePermit>, RejectReason> {
        match &self.channel_quota {
            Some(quota) => quota
                .clone()
                .try_acquire_owned()
                .map(Some)
                .map_err(|_| RejectReason::ResourceShortage("too many channels on this connection".to_string())),
            None => Ok(None),
        }
    }

    pub async fn dial(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        let started = Instant::now();
        let res = match self.dial_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
                Ok(res) => res,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, format!("dial timeout after {timeout:?}"))),
            },
            None => TcpStream::connect((host, port)).await,
        };
        histogram!(METRICS_OUTBOUND_DIAL_HISTOGRAM).record(started.elapsed().as_millis() as f64);
        res
    }

    /// Checks that need no I/O: payload and channel quota. The dial happens later, off the session loop.
    pub fn accept(&self, req: &OutboundConnectRequest) -> Result<PendingOutbound, RejectReason> {
        let (host, port) = req.destination()?;
        let permit = self.reserve()?;
        Ok(PendingOutbound {
            forwarder: self.clone(),
            host: host.to_string(),
            port,
            label: format!("{}:{} => {host}:{port}", req.origin_addr, req.origin_port),
            permit,
        })
    }
}

impl PendingOutbound {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub async fn connect(self) -> Result<OutboundTarget, RejectReason> {
        let stream = self.forwarder.dial(&self.host, self.port).await.map_err(|e| RejectReason::ConnectFailed(e.to_string()))?;
        Ok(OutboundTarget {
            stream,
            label: self.label,
            _permit: self.permit,
        })
    }

    /// Dial and bridge with `channel` on its own task. A failed dial closes the channel.
    pub fn spawn<C: TunnelConn + 'static>(self, channel: C) -> JoinHandle<()> {
        tokio::spawn(async move {
            let label = self.label.clone();
            match self.connect().await {
                Ok(target) => target.bridge(channel).await,
                Err(reason) => {
                    counter!(METRICS_OUTBOUND_REJECT_COUNT).increment(1);
                    log::warn!("[Outbound] {label} closing channel, code {} {reason}", reason.code());
                    channel.close().await;
                }
            }
        })
    }
}

impl OutboundTarget {
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Bridge `channel` with the dialed stream, closing both when done.
    pub async fn bridge<C: TunnelConn>(mut self, mut channel: C) {
        counter!(METRICS_OUTBOUND_COUNT).increment(1);
        gauge!(METRICS_OUTBOUND_LIVE).increment(1.0);
        log::info!("[Outbound] {} bridging", self.label);
        let stats = bridge(&mut channel, &mut self.stream).await;
        if let Some(e) = &stats.first_error {
            log::debug!("[Outbound] {} ended with {e}", self.label);
        }
        log::info!("[Outbound] {} done, up {} bytes, down {} bytes", self.label, stats.a_to_b, stats.b_to_a);
        counter!(METRICS_BRIDGE_BYTES).increment(stats.a_to_b + stats.b_to_a);
        channel.close().await;
        self.stream.close().await;
        gauge!(METRICS_OUTBOUND_LIVE).decrement(1.0);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use protocol::request::{OutboundConnectRequest, RejectReason};
    use test_log::test;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::OutboundForwarder;
    use crate::tests::{closed_port, echo_server, tcp_pair};

    fn request(host: &str, port: u32) -> OutboundConnectRequest {
        OutboundConnectRequest {
            dest_addr: host.to_string(),
            dest_port: port,
            origin_addr: "127.0.0.1".to_string(),
            origin_port: 40000,
        }
    }

    #[test(tokio::test)]
    async fn accepted_request_dials_and_bridges_echo() {
        let echo = echo_server().await;
        let forwarder = OutboundForwarder::default();
        let pending = forwarder.accept(&request("127.0.0.1", echo.port() as u32)).expect("should accept");
        assert!(pending.label().ends_with(&format!("127.0.0.1:{}", echo.port())));

        let (mut user, channel_side) = tcp_pair().await;
        let task = pending.spawn(channel_side);

        user.write_all(b"hello outbound").await.expect("should write");
        let mut buf = [0u8; 14];
        user.read_exact(&mut buf).await.expect("should read");
        assert_eq!(&buf, b"hello outbound");

        drop(user);
        tokio::time::timeout(Duration::from_secs(2), task).await.expect("bridge should finish").expect("should join");
    }

    #[test]
    fn invalid_port_is_rejected_without_dial() {
        let forwarder = OutboundForwarder::default();
        let res = forwarder.accept(&request("127.0.0.1", 70_000));
        assert!(matches!(res, Err(RejectReason::InvalidPayload(_))));
        assert!(matches!(forwarder.accept(&request("", 80)), Err(RejectReason::InvalidPayload(_))));
    }

    #[test(tokio::test)]
    async fn unreachable_destination_is_connect_failed() {
        let port = closed_port().await;
        let forwarder = OutboundForwarder::new(Some(Duration::from_secs(2)), None);
        let pending = forwarder.accept(&request("127.0.0.1", port as u32)).expect("should accept");
        assert!(matches!(pending.connect().await, Err(RejectReason::ConnectFailed(_))));
    }

    #[test(tokio::test)]
    async fn failed_dial_closes_channel() {
        let port = closed_port().await;
        let forwarder = OutboundForwarder::default();
        let pending = forwarder.accept(&request("127.0.0.1", port as u32)).expect("should accept");

        let (mut user, channel_side) = tcp_pair().await;
        let task = pending.spawn(channel_side);
        let mut buf = vec![];
        let read = tokio::time::timeout(Duration::from_secs(5), user.read_to_end(&mut buf)).await.expect("channel should close");
        assert!(matches!(read, Ok(0) | Err(_)));
        task.await.expect("should join");
    }

    #[test(tokio::test)]
    async fn channel_quota_limits_concurrent_requests() {
        let echo = echo_server().await;
        let forwarder = OutboundForwarder::new(None, Some(1));
        let first = forwarder.accept(&request("127.0.0.1", echo.port() as u32)).expect("should accept");
        let second = forwarder.accept(&request("127.0.0.1", echo.port() as u32));
        assert!(matches!(second, Err(RejectReason::ResourceShortage(_))));

        // the slot travels with the dialed target
        let target = first.connect().await.expect("should connect");
        assert!(forwarder.accept(&request("127.0.0.1", echo.port() as u32)).is_err());
        drop(target);
        assert!(forwarder.accept(&request("127.0.0.1", echo.port() as u32)).is_ok());
    }
}
