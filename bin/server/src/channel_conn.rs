use std::{
    future::Future,
    io,
    pin::Pin,
    task::{Context, Poll},
};

use protocol::stream::{ConnAddr, DeadlineSupport, TunnelConn};
use russh::{
    server::{Handle, Msg},
    Channel, ChannelId, ChannelStream,
};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

const LOCAL_ADDR: &str = "ssh-local";
const REMOTE_ADDR: &str = "ssh-remote";

/// One SSH channel seen as a plain byte stream.
///
/// Channels have no socket addresses and no deadlines, so both are reported explicitly.
pub struct ChannelConn {
    id: ChannelId,
    stream: ChannelStream<Msg>,
    handle: Handle,
}

impl ChannelConn {
    pub fn new(channel: Channel<Msg>, handle: Handle) -> Self {
        Self {
            id: channel.id(),
            stream: channel.into_stream(),
            handle,
        }
    }
}

impl AsyncRead for ChannelConn {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for ChannelConn {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize, io::Error>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

impl TunnelConn for ChannelConn {
    fn local_addr(&self) -> ConnAddr {
        ConnAddr::Named(LOCAL_ADDR)
    }

    fn peer_addr(&self) -> ConnAddr {
        ConnAddr::Named(REMOTE_ADDR)
    }

    fn deadline_support(&self) -> DeadlineSupport {
        DeadlineSupport::Unsupported
    }

    fn close(self) -> impl Future<Output = ()> + Send {
        async move {
            let Self { id, mut stream, handle } = self;
            // eof may already be sent by the bridge
            if let Err(e) = stream.shutdown().await {
                log::debug!("[ChannelConn] channel {id:?} shutdown error {e}");
            }
            if handle.close(id).await.is_err() {
                log::debug!("[ChannelConn] channel {id:?} already gone");
            }
        }
    }
}
