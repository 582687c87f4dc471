use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const BRIDGE_BUF_SIZE: usize = 16 * 1024;

/// Outcome of one bridge, both directions finished.
#[derive(Debug, Default)]
pub struct BridgeStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
    /// First I/O error seen by either direction. Errors only end the relay, they are never reported upstream.
    pub first_error: Option<io::Error>,
}

/// Copy bytes both ways between `a` and `b` until both directions are done.
///
/// When one side's read half reaches EOF (or fails) the other side's write half is shut down,
/// the opposite direction keeps flowing. The caller still owns and closes both endpoints.
pub async fn bridge<A, B>(a: &mut A, b: &mut B) -> BridgeStats
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let ((a_to_b, up_err), (b_to_a, down_err)) = tokio::join!(pipe(&mut a_read, &mut b_write), pipe(&mut b_read, &mut a_write));

    BridgeStats {
        a_to_b,
        b_to_a,
        first_error: up_err.or(down_err),
    }
}

async fn pipe<R, W>(reader: &mut R, writer: &mut W) -> (u64, Option<io::Error>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BRIDGE_BUF_SIZE];
    let mut total = 0;
    let err = loop {
        match reader.read(&mut buf).await {
            Ok(0) => break None,
            Ok(n) => {
                if let Err(e) = writer.write_all(&buf[..n]).await {
                    break Some(e);
                }
                total += n as u64;
            }
            Err(e) => break Some(e),
        }
    };
    let shutdown_err = writer.shutdown().await.err();
    (total, err.or(shutdown_err))
}
