use std::{sync::Arc, time::Duration};

use test_log::test;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
    sync::oneshot,
};

use super::{closed_port, connect_client, echo_server, saturated_listener, start_server};
use crate::TunnelLimits;

#[test(tokio::test)]
async fn direct_tcpip_relays_to_destination() {
    let echo = echo_server().await;
    let server = start_server(TunnelLimits::default(), None).await;
    let (client, _forwarded_rx) = connect_client(&server).await;

    let channel = client.channel_open_direct_tcpip("127.0.0.1", echo.port() as u32, "127.0.0.1", 50000).await.expect("should open");
    let mut stream = channel.into_stream();
    stream.write_all(b"hello outbound").await.expect("should write");
    let mut buf = [0u8; 14];
    stream.read_exact(&mut buf).await.expect("should read");
    assert_eq!(&buf, b"hello outbound");
}

#[test(tokio::test)]
async fn unreachable_destination_keeps_connection_usable() {
    let echo = echo_server().await;
    let port = closed_port().await;
    let server = start_server(TunnelLimits::default(), None).await;
    let (client, _forwarded_rx) = connect_client(&server).await;

    // the dial runs after confirmation, a refused destination shows up as a closed channel
    let refused = client.channel_open_direct_tcpip("127.0.0.1", port as u32, "127.0.0.1", 50000).await.expect("should open");
    let mut stream = refused.into_stream();
    let mut rest = vec![];
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut rest)).await.expect("channel should close");
    assert!(matches!(read, Ok(0) | Err(_)));
    assert!(client.channel_open_direct_tcpip("127.0.0.1", 70_000, "127.0.0.1", 50000).await.is_err());

    let channel = client.channel_open_direct_tcpip("127.0.0.1", echo.port() as u32, "127.0.0.1", 50001).await.expect("should open");
    let mut stream = channel.into_stream();
    stream.write_all(b"still alive").await.expect("should write");
    let mut buf = [0u8; 11];
    stream.read_exact(&mut buf).await.expect("should read");
    assert_eq!(&buf, b"still alive");
}

#[test(tokio::test)]
async fn slow_dial_does_not_stall_other_channels() {
    let echo = echo_server().await;
    let (saturated, _queued) = saturated_listener().await;
    let slow_port = saturated.local_addr().expect("should have addr").port();
    let server = start_server(TunnelLimits::default(), None).await;
    let (client, _forwarded_rx) = connect_client(&server).await;
    let client = Arc::new(client);

    let channel = client.channel_open_direct_tcpip("127.0.0.1", echo.port() as u32, "127.0.0.1", 50000).await.expect("should open");
    let mut stream = channel.into_stream();

    let slow_client = client.clone();
    let _slow = tokio::spawn(async move { slow_client.channel_open_direct_tcpip("127.0.0.1", slow_port as u32, "127.0.0.1", 50001).await });
    tokio::time::sleep(Duration::from_millis(200)).await;

    stream.write_all(b"while dialing").await.expect("should write");
    let mut buf = [0u8; 13];
    tokio::time::timeout(Duration::from_secs(3), stream.read_exact(&mut buf)).await.expect("existing channel should keep flowing").expect("should read");
    assert_eq!(&buf, b"while dialing");

    let fresh = tokio::time::timeout(Duration::from_secs(3), client.channel_open_direct_tcpip("127.0.0.1", echo.port() as u32, "127.0.0.1", 50002))
        .await
        .expect("new channel open should not wait for the dial");
    assert!(fresh.is_ok());
}

#[test(tokio::test)]
async fn closing_channel_closes_dialed_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("should bind");
    let port = listener.local_addr().expect("should have addr").port();
    let (closed_tx, closed_rx) = oneshot::channel();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("should accept");
        let mut buf = vec![];
        let _ = stream.read_to_end(&mut buf).await;
        let _ = closed_tx.send(buf);
    });

    let server = start_server(TunnelLimits::default(), None).await;
    let (client, _forwarded_rx) = connect_client(&server).await;
    let channel = client.channel_open_direct_tcpip("127.0.0.1", port as u32, "127.0.0.1", 50000).await.expect("should open");
    let mut stream = channel.into_stream();
    stream.write_all(b"last words").await.expect("should write");
    stream.shutdown().await.expect("should shutdown");

    let received = tokio::time::timeout(Duration::from_secs(5), closed_rx).await.expect("dialed side should close").expect("should receive");
    assert_eq!(received, b"last words");
}

#[test(tokio::test)]
async fn channel_limit_rejects_extra_channel() {
    let echo = echo_server().await;
    let limits = TunnelLimits {
        max_channels_per_connection: Some(1),
        ..Default::default()
    };
    let server = start_server(limits, None).await;
    let (client, _forwarded_rx) = connect_client(&server).await;

    let first = client.channel_open_direct_tcpip("127.0.0.1", echo.port() as u32, "127.0.0.1", 50000).await.expect("should open");
    assert!(client.channel_open_direct_tcpip("127.0.0.1", echo.port() as u32, "127.0.0.1", 50001).await.is_err());
    drop(first);
}

#[test(tokio::test)]
async fn socks_route_serves_socks5_over_channel() {
    let echo = echo_server().await;
    let server = start_server(TunnelLimits::default(), Some("socks.internal")).await;
    let (client, _forwarded_rx) = connect_client(&server).await;

    let channel = client.channel_open_direct_tcpip("socks.internal", 1080, "127.0.0.1", 50000).await.expect("should open");
    let mut stream = channel.into_stream();
    stream.write_all(&[0x05, 0x01, 0x00]).await.expect("should write");
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.expect("should read");
    assert_eq!(method, [0x05, 0x00]);

    let mut req = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
    req.extend_from_slice(&echo.port().to_be_bytes());
    stream.write_all(&req).await.expect("should write");
    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.expect("should read");
    assert_eq!(reply[1], 0x00);

    stream.write_all(b"socks over ssh").await.expect("should write");
    let mut buf = [0u8; 14];
    stream.read_exact(&mut buf).await.expect("should read");
    assert_eq!(&buf, b"socks over ssh");
}
