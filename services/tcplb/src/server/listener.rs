//! Client-facing listener, plain TCP or TLS.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use crate::error::{ProxyError, SetupError};

/// How accepted sockets are turned into client streams.
#[derive(Clone)]
pub enum Acceptor {
    Plain,
    Tls(TlsAcceptor),
}

impl Acceptor {
    pub fn is_tls(&self) -> bool {
        matches!(self, Acceptor::Tls(_))
    }

    /// Finish accepting `stream`, running the TLS handshake if enabled.
    pub async fn accept(
        &self,
        stream: TcpStream,
        handshake_timeout: Duration,
    ) -> Result<ClientStream, ProxyError> {
        match self {
            Acceptor::Plain => Ok(ClientStream::Plain(stream)),
            Acceptor::Tls(acceptor) => {
                match timeout(handshake_timeout, acceptor.accept(stream)).await {
                    Ok(Ok(tls)) => Ok(ClientStream::Tls(Box::new(tls))),
                    Ok(Err(e)) => Err(ProxyError::Handshake(e)),
                    Err(_) => Err(ProxyError::Handshake(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "handshake timeout",
                    ))),
                }
            }
        }
    }
}

/// A client connection after the listener is done with it.
pub enum ClientStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for ClientStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            ClientStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            ClientStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            ClientStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            ClientStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            ClientStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            ClientStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            ClientStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            ClientStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// A bound listener plus the way its connections are accepted.
pub struct Listener {
    listener: TcpListener,
    acceptor: Acceptor,
}

impl Listener {
    /// Bind `addr`. A bare `:port` address binds all interfaces, IPv6 and
    /// IPv4 both, falling back to IPv4 only on hosts without IPv6.
    pub async fn bind(addr: &str, acceptor: Acceptor) -> Result<Self, SetupError> {
        let mut bind_addr = normalize_listen_addr(addr);
        let listener = match TcpListener::bind(&bind_addr).await {
            Ok(listener) => listener,
            Err(e) if is_bare_port(addr) => {
                warn!(bind_addr = %bind_addr, error = %e, "IPv6 bind failed, using IPv4 only");
                bind_addr = format!("0.0.0.0{}", addr.trim());
                TcpListener::bind(&bind_addr).await.map_err(|source| SetupError::Bind {
                    addr: bind_addr.clone(),
                    source,
                })?
            }
            Err(source) => {
                return Err(SetupError::Bind {
                    addr: bind_addr,
                    source,
                })
            }
        };

        info!(
            bind_addr = %bind_addr,
            tls = acceptor.is_tls(),
            "Listener bound"
        );

        Ok(Self { listener, acceptor })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn acceptor(&self) -> &Acceptor {
        &self.acceptor
    }

    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.listener.accept().await
    }
}

fn is_bare_port(addr: &str) -> bool {
    addr.trim().starts_with(':')
}

/// `:8080` -> `[::]:8080`; anything else unchanged.
pub fn normalize_listen_addr(addr: &str) -> String {
    let addr = addr.trim();
    if is_bare_port(addr) {
        format!("[::]{addr}")
    } else {
        addr.to_string()
    }
}

/// Client IP as a string, without the port.
///
/// IPv4 clients of a dual-stack listener arrive as `::ffff:a.b.c.d`; they
/// are reported in plain dotted form so filters and limits see one spelling.
pub fn client_ip(peer: &SocketAddr) -> String {
    peer.ip().to_canonical().to_string()
}
