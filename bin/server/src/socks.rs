use std::{
    io,
    net::{Ipv4Addr, Ipv6Addr},
    time::Duration,
};

use anyhow::anyhow;
use metrics::counter;
use protocol::stream::{DeadlineSupport, TunnelConn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::{bridge::bridge, metrics::METRICS_BRIDGE_BYTES, outbound::OutboundForwarder};

const SOCKS_VERSION: u8 = 0x05;
const AUTH_NO_AUTH: u8 = 0x00;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ADDR_IPV4: u8 = 0x01;
const ADDR_DOMAIN: u8 = 0x03;
const ADDR_IPV6: u8 = 0x04;
const REPLY_SUCCESS: u8 = 0x00;
const REPLY_GENERAL_FAILURE: u8 = 0x01;
const REPLY_HOST_UNREACHABLE: u8 = 0x04;
const REPLY_CONNECTION_REFUSED: u8 = 0x05;
const REPLY_TTL_EXPIRED: u8 = 0x06;
const REPLY_CMD_NOT_SUPPORTED: u8 = 0x07;
const REPLY_ADDR_NOT_SUPPORTED: u8 = 0x08;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, PartialEq, Eq)]
struct SocksTarget {
    host: String,
    port: u16,
}

/// Serve one SOCKS5 CONNECT exchange over `conn`, then relay it to the requested destination.
///
/// The handshake is bounded by a timeout only when `conn` supports deadlines.
pub async fn serve_socks<C: TunnelConn>(mut conn: C, outbound: OutboundForwarder) -> anyhow::Result<()> {
    let peer = conn.peer_addr();
    let target = match conn.deadline_support() {
        DeadlineSupport::Supported => tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake(&mut conn)).await.map_err(|_| anyhow!("socks handshake timeout"))?,
        DeadlineSupport::Unsupported => {
            log::debug!("[Socks] {peer} has no deadlines, handshake runs without timeout");
            handshake(&mut conn).await
        }
    };
    let target = match target {
        Ok(target) => target,
        Err(e) => {
            conn.close().await;
            return Err(e);
        }
    };

    let mut upstream = match outbound.dial(&target.host, target.port).await {
        Ok(upstream) => upstream,
        Err(e) => {
            let _ = reply(&mut conn, dial_error_reply(&e)).await;
            conn.close().await;
            return Err(anyhow!("socks connect {}:{} failed {e}", target.host, target.port));
        }
    };
    reply(&mut conn, REPLY_SUCCESS).await?;

    log::info!("[Socks] {peer} => {}:{} bridging", target.host, target.port);
    let stats = bridge(&mut conn, &mut upstream).await;
    log::info!("[Socks] {peer} => {}:{} done, up {} bytes, down {} bytes", target.host, target.port, stats.a_to_b, stats.b_to_a);
    counter!(METRICS_BRIDGE_BYTES).increment(stats.a_to_b + stats.b_to_a);
    conn.close().await;
    upstream.close().await;
    Ok(())
}

async fn handshake<C: TunnelConn>(conn: &mut C) -> anyhow::Result<SocksTarget> {
    let mut head = [0u8; 2];
    conn.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(anyhow!("unsupported socks version {}", head[0]));
    }
    let mut methods = vec![0u8; head[1] as usize];
    conn.read_exact(&mut methods).await?;
    if !methods.contains(&AUTH_NO_AUTH) {
        conn.write_all(&[SOCKS_VERSION, AUTH_NO_ACCEPTABLE]).await?;
        return Err(anyhow!("no acceptable socks auth method in {methods:?}"));
    }
    conn.write_all(&[SOCKS_VERSION, AUTH_NO_AUTH]).await?;

    let mut req = [0u8; 4];
    conn.read_exact(&mut req).await?;
    if req[0] != SOCKS_VERSION {
        return Err(anyhow!("unsupported socks version {} in request", req[0]));
    }
    if req[1] != CMD_CONNECT {
        reply(conn, REPLY_CMD_NOT_SUPPORTED).await?;
        return Err(anyhow!("unsupported socks command {}", req[1]));
    }

    let host = match req[3] {
        ADDR_IPV4 => {
            let mut addr = [0u8; 4];
            conn.read_exact(&mut addr).await?;
            Ipv4Addr::from(addr).to_string()
        }
        ADDR_IPV6 => {
            let mut addr = [0u8; 16];
            conn.read_exact(&mut addr).await?;
            Ipv6Addr::from(addr).to_string()
        }
        ADDR_DOMAIN => {
            let len = conn.read_u8().await? as usize;
            let mut domain = vec![0u8; len];
            conn.read_exact(&mut domain).await?;
            String::from_utf8(domain).map_err(|_| anyhow!("socks domain is not utf8"))?
        }
        other => {
            reply(conn, REPLY_ADDR_NOT_SUPPORTED).await?;
            return Err(anyhow!("unsupported socks address type {other}"));
        }
    };
    let port = conn.read_u16().await?;
    Ok(SocksTarget { host, port })
}

async fn reply<C: TunnelConn>(conn: &mut C, code: u8) -> io::Result<()> {
    conn.write_all(&[SOCKS_VERSION, code, 0x00, ADDR_IPV4, 0, 0, 0, 0, 0, 0]).await?;
    conn.flush().await
}

fn dial_error_reply(e: &io::Error) -> u8 {
    match e.kind() {
        io::ErrorKind::ConnectionRefused => REPLY_CONNECTION_REFUSED,
        io::ErrorKind::TimedOut => REPLY_TTL_EXPIRED,
        io::ErrorKind::HostUnreachable | io::ErrorKind::NetworkUnreachable => REPLY_HOST_UNREACHABLE,
        _ => REPLY_GENERAL_FAILURE,
    }
}
