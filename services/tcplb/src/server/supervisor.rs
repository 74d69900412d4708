//! Accept loop and per-connection admission pipeline.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn, Instrument};

use super::listener::{client_ip, Acceptor, Listener};
use super::tracker::{ConnectionGuard, ConnectionTracker};
use crate::admission::{IpFilter, RateLimiter};
use crate::proxy::ProxyEngine;

/// Default time to wait for connections to finish after force-close.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Default bound on the client TLS handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause after a failed accept so a persistent error cannot spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Counters for the supervisor.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently being handled.
    pub connections_active: AtomicU64,
    /// Connections finished, for any reason.
    pub connections_closed: AtomicU64,
    /// Rejected by the IP filter.
    pub rejected_ip_filter: AtomicU64,
    /// Rejected by the rate limiter.
    pub rejected_rate_limit: AtomicU64,
    /// Admitted but no backend could serve them, or the handshake failed.
    pub proxy_failures: AtomicU64,
    /// Failed accept calls. The loop keeps running after each.
    pub accept_errors: AtomicU64,
}

/// Source of accepted sockets for the accept loop.
pub trait Incoming: Send + Sync + 'static {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// How accepted sockets become client streams.
    fn acceptor(&self) -> &Acceptor;
}

impl Incoming for Listener {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        Listener::accept(self)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Listener::local_addr(self)
    }

    fn acceptor(&self) -> &Acceptor {
        Listener::acceptor(self)
    }
}

/// Everything a connection task needs, shared across tasks.
struct ConnectionContext {
    acceptor: Acceptor,
    ip_filter: Arc<IpFilter>,
    rate_limiter: Arc<RateLimiter>,
    engine: Arc<ProxyEngine>,
    handshake_timeout: Duration,
    stats: Arc<ConnectionStats>,
}

/// Owns the listener and every connection accepted from it.
pub struct Supervisor<L = Listener> {
    listener: L,
    ip_filter: Arc<IpFilter>,
    rate_limiter: Arc<RateLimiter>,
    engine: Arc<ProxyEngine>,
    tracker: ConnectionTracker,
    stats: Arc<ConnectionStats>,
    handshake_timeout: Duration,
    grace_period: Duration,
}

impl<L: Incoming> Supervisor<L> {
    pub fn new(
        listener: L,
        ip_filter: Arc<IpFilter>,
        rate_limiter: Arc<RateLimiter>,
        engine: Arc<ProxyEngine>,
    ) -> Self {
        Self {
            listener,
            ip_filter,
            rate_limiter,
            engine,
            tracker: ConnectionTracker::new(),
            stats: Arc::new(ConnectionStats::default()),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> Arc<ConnectionStats> {
        Arc::clone(&self.stats)
    }

    pub fn tracker(&self) -> ConnectionTracker {
        self.tracker.clone()
    }

    /// Accept connections until `shutdown` turns true, then close every
    /// open connection and wait for their tasks to finish.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let Supervisor {
            listener,
            ip_filter,
            rate_limiter,
            engine,
            tracker,
            stats,
            handshake_timeout,
            grace_period,
        } = self;

        let local_addr = listener.local_addr()?;
        info!(bind_addr = %local_addr, "Accepting connections");

        let ctx = Arc::new(ConnectionContext {
            acceptor: listener.acceptor().clone(),
            ip_filter,
            rate_limiter,
            engine,
            handshake_timeout,
            stats,
        });

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() {
                        info!("Shutdown sender dropped, stopping accept loop");
                        break;
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => spawn_connection(&ctx, &tracker, stream, peer_addr),
                    Err(e) => {
                        ctx.stats.accept_errors.fetch_add(1, Ordering::Relaxed);
                        warn!(error = %e, "Error accepting connection");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }

        drop(listener);

        let signalled = tracker.close_all();
        info!(
            connections = signalled,
            "Stopped accepting, closing open connections"
        );

        if tracker.wait_for_drain(grace_period).await {
            info!("All connections finished");
        } else {
            warn!(
                remaining = tracker.active(),
                grace_period_secs = grace_period.as_secs_f64(),
                "Connections still open after grace period"
            );
        }

        Ok(())
    }
}

fn spawn_connection(
    ctx: &Arc<ConnectionContext>,
    tracker: &ConnectionTracker,
    stream: TcpStream,
    peer_addr: SocketAddr,
) {
    let Some(guard) = tracker.register(peer_addr) else {
        debug!(peer_addr = %peer_addr, "Shutting down, dropping new connection");
        return;
    };

    ctx.stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
    ctx.stats.connections_active.fetch_add(1, Ordering::Relaxed);

    let ctx = Arc::clone(ctx);
    tokio::spawn(
        async move {
            let stats = Arc::clone(&ctx.stats);
            handle_connection(ctx, stream, peer_addr, guard).await;
            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
            stats.connections_closed.fetch_add(1, Ordering::Relaxed);
        }
        .instrument(tracing::info_span!("connection", peer = %peer_addr)),
    );
}

/// Admission pipeline for one connection. The guard, and the admission
/// permit taken here, are released when this returns or is cut short by a
/// force-close.
async fn handle_connection(
    ctx: Arc<ConnectionContext>,
    stream: TcpStream,
    peer_addr: SocketAddr,
    mut guard: ConnectionGuard,
) {
    let ip = client_ip(&peer_addr);

    if !ctx.ip_filter.allow(&ip) {
        ctx.stats.rejected_ip_filter.fetch_add(1, Ordering::Relaxed);
        warn!(ip = %ip, mode = %ctx.ip_filter.mode(), "Connection rejected by IP filter");
        return;
    }

    let Some(_permit) = ctx.rate_limiter.acquire(&ip) else {
        ctx.stats.rejected_rate_limit.fetch_add(1, Ordering::Relaxed);
        warn!(ip = %ip, "Connection rejected due to rate limiting");
        return;
    };

    let session = async {
        let client = ctx.acceptor.accept(stream, ctx.handshake_timeout).await?;
        ctx.engine.handle(client).await
    };

    tokio::select! {
        result = session => match result {
            Ok(forwarded) => debug!(
                bytes_to_backend = forwarded.bytes_to_backend,
                bytes_from_backend = forwarded.bytes_from_backend,
                "Connection closed"
            ),
            Err(e) => {
                ctx.stats.proxy_failures.fetch_add(1, Ordering::Relaxed);
                warn!(ip = %ip, reason = e.reason_code(), error = %e, "Connection failed");
            }
        },
        _ = guard.closed() => {
            debug!(conn_id = guard.id(), "Connection force-closed by shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::AsyncReadExt;

    use crate::proxy::ServerPool;

    /// Fails the first `failures` accepts, then behaves like `inner`.
    struct FlakyListener {
        inner: Listener,
        failures: AtomicUsize,
    }

    impl Incoming for FlakyListener {
        fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
            async move {
                let failed = self
                    .failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if failed {
                    return Err(io::Error::other("too many open files"));
                }
                self.inner.accept().await
            }
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            self.inner.local_addr()
        }

        fn acceptor(&self) -> &Acceptor {
            self.inner.acceptor()
        }
    }

    #[tokio::test]
    async fn test_accept_errors_do_not_stop_the_loop() {
        let inner = Listener::bind("127.0.0.1:0", Acceptor::Plain).await.unwrap();
        let addr = inner.local_addr().unwrap();
        let listener = FlakyListener {
            inner,
            failures: AtomicUsize::new(3),
        };

        let pool = Arc::new(ServerPool::new());
        let supervisor = Supervisor::new(
            listener,
            Arc::new(IpFilter::disabled()),
            Arc::new(RateLimiter::per_minute(10, 10)),
            Arc::new(ProxyEngine::new(pool, Duration::from_millis(100))),
        );
        let stats = supervisor.stats();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let run = tokio::spawn(supervisor.run(shutdown_rx));

        // Queued in the backlog while the loop works through the failures.
        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("connection is served after the accept errors");
        assert!(matches!(read, Ok(0) | Err(_)));

        assert_eq!(stats.accept_errors.load(Ordering::Relaxed), 3);
        assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 1);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .expect("supervisor stops")
            .unwrap()
            .unwrap();
    }
}
