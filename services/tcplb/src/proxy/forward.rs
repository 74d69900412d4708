//! Bidirectional byte relay between a client and a backend.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

const RELAY_BUFFER_SIZE: usize = 8192;

/// Bytes moved by one relayed connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardStats {
    pub bytes_to_backend: u64,
    pub bytes_from_backend: u64,
}

/// Relay data between `client` and `backend` until both directions finish.
///
/// When one direction hits end-of-stream (or fails) the write side of the
/// opposite stream is shut down, so the peer sees EOF right away instead of
/// waiting on a half-open connection. Both streams are dropped, and thereby
/// closed, when this returns.
pub async fn proxy_bidirectional<C, B>(client: C, backend: B) -> ForwardStats
where
    C: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut backend_read, mut backend_write) = tokio::io::split(backend);

    let (bytes_to_backend, bytes_from_backend) = tokio::join!(
        relay(&mut client_read, &mut backend_write, "client_to_backend"),
        relay(&mut backend_read, &mut client_write, "backend_to_client"),
    );

    ForwardStats {
        bytes_to_backend,
        bytes_from_backend,
    }
}

/// Copy `reader` into `writer`, then half-close `writer`.
async fn relay<R, W>(reader: &mut R, writer: &mut W, direction: &'static str) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];

    let result: io::Result<()> = loop {
        match reader.read(&mut buf).await {
            Ok(0) => break Ok(()),
            Ok(n) => {
                // Flush so TLS writers emit the record right away.
                if let Err(e) = write_and_flush(writer, &buf[..n]).await {
                    break Err(e);
                }
                total += n as u64;
            }
            Err(e) => break Err(e),
        }
    };

    if let Err(e) = result {
        debug!(direction, error = %e, "Relay ended with error");
    }

    // Peer may already be gone.
    let _ = writer.shutdown().await;

    total
}

async fn write_and_flush<W>(writer: &mut W, data: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(data).await?;
    writer.flush().await
}
