//! Backend acquisition with failover and recovery, then forwarding.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{info, warn};

use super::backend::{connect, Backend, ServerPool};
use super::forward::{proxy_bidirectional, ForwardStats};
use super::round_robin::RoundRobin;
use crate::error::ProxyError;

/// Counters for the proxy engine.
#[derive(Debug, Default)]
pub struct ProxyStats {
    /// Backend connections established.
    pub backend_connected: AtomicU64,
    /// Backend dials that failed.
    pub backend_failed: AtomicU64,
    /// Backends brought back by a recovery scan.
    pub recoveries: AtomicU64,
    /// Bytes relayed client -> backend.
    pub bytes_to_backend: AtomicU64,
    /// Bytes relayed backend -> client.
    pub bytes_from_backend: AtomicU64,
}

/// Picks a backend for each client connection and relays bytes to it.
pub struct ProxyEngine {
    pool: Arc<ServerPool>,
    round_robin: RoundRobin,
    connect_timeout: Duration,
    stats: ProxyStats,
}

impl ProxyEngine {
    pub fn new(pool: Arc<ServerPool>, connect_timeout: Duration) -> Self {
        Self {
            round_robin: RoundRobin::new(Arc::clone(&pool)),
            pool,
            connect_timeout,
            stats: ProxyStats::default(),
        }
    }

    pub fn stats(&self) -> &ProxyStats {
        &self.stats
    }

    /// Serve one client connection.
    ///
    /// On error the client stream has already been dropped, which closes it
    /// without sending anything.
    pub async fn handle<S>(&self, client: S) -> Result<ForwardStats, ProxyError>
    where
        S: AsyncRead + AsyncWrite + Send,
    {
        if self.pool.is_empty() {
            return Err(ProxyError::NoServersConfigured);
        }

        let (backend_stream, backend) = self.acquire_backend().await?;

        info!(backend_addr = %backend.address(), "Forwarding connection to backend");

        let forwarded = proxy_bidirectional(client, backend_stream).await;

        self.stats
            .bytes_to_backend
            .fetch_add(forwarded.bytes_to_backend, Ordering::Relaxed);
        self.stats
            .bytes_from_backend
            .fetch_add(forwarded.bytes_from_backend, Ordering::Relaxed);

        Ok(forwarded)
    }

    /// Select and connect to a backend, failing over on dial errors.
    ///
    /// Makes at most one attempt per pool member. A failed dial marks the
    /// backend dead right away so concurrent selections skip it without
    /// waiting for the next health check.
    pub async fn acquire_backend(&self) -> Result<(TcpStream, Arc<Backend>), ProxyError> {
        let attempts = self.pool.len();

        for attempt in 1..=attempts {
            let Some(backend) = self.round_robin.next() else {
                return self.recovery_scan().await;
            };

            match connect(backend.address(), self.connect_timeout).await {
                Ok(stream) => {
                    self.stats.backend_connected.fetch_add(1, Ordering::Relaxed);
                    return Ok((stream, backend));
                }
                Err(e) => {
                    self.stats.backend_failed.fetch_add(1, Ordering::Relaxed);
                    backend.mark_dead();
                    warn!(
                        backend_addr = %backend.address(),
                        attempt,
                        error = %e,
                        "Backend connection failed, marked dead"
                    );
                }
            }
        }

        Err(ProxyError::AllAttemptsFailed { attempts })
    }

    /// Dial every backend in pool order and use the first that answers.
    async fn recovery_scan(&self) -> Result<(TcpStream, Arc<Backend>), ProxyError> {
        warn!("No alive backend in rotation, scanning pool for recovery");

        for backend in self.pool.list_servers() {
            match connect(backend.address(), self.connect_timeout).await {
                Ok(stream) => {
                    backend.mark_alive();
                    self.stats.recoveries.fetch_add(1, Ordering::Relaxed);
                    self.stats.backend_connected.fetch_add(1, Ordering::Relaxed);
                    info!(backend_addr = %backend.address(), "Recovered backend");
                    return Ok((stream, backend));
                }
                Err(e) => {
                    self.stats.backend_failed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        backend_addr = %backend.address(),
                        error = %e,
                        "Recovery probe failed"
                    );
                }
            }
        }

        Err(ProxyError::NoAliveBackend)
    }
}
