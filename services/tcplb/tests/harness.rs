//! Test harness for balancer integration tests.
//!
//! Provides helpers to spawn echo backends, a running balancer, and TLS
//! material for the TLS listener.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use rustls::pki_types::{CertificateDer, ServerName};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use tcplb::server::{load_acceptor, ConnectionStats, ConnectionTracker};
use tcplb::{
    Acceptor, HealthChecker, IpFilter, Listener, ProxyEngine, RateLimiter, ServerPool, Supervisor,
};

static INIT_CRYPTO: Once = Once::new();

fn init_crypto_provider() {
    INIT_CRYPTO.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .ok();
    });
}

pub const DIAL_TIMEOUT: Duration = Duration::from_millis(500);

#[allow(dead_code)]
pub struct TcpEchoBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    pub bytes_received: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[allow(dead_code)]
impl TcpEchoBackend {
    pub async fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        Ok(Self::serve(listener))
    }

    /// Serve on an already bound listener, e.g. to revive a dead address.
    pub fn serve(listener: TcpListener) -> Self {
        let addr = listener.local_addr().expect("bound listener has an address");
        let connections = Arc::new(AtomicU64::new(0));
        let bytes_received = Arc::new(AtomicU64::new(0));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let conn_clone = Arc::clone(&connections);
        let bytes_clone = Arc::clone(&bytes_received);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((mut stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                let bytes = Arc::clone(&bytes_clone);
                                tokio::spawn(async move {
                                    let mut buf = vec![0u8; 8192];
                                    loop {
                                        match stream.read(&mut buf).await {
                                            Ok(0) => break,
                                            Ok(n) => {
                                                bytes.fetch_add(n as u64, Ordering::Relaxed);
                                                if stream.write_all(&buf[..n]).await.is_err() {
                                                    break;
                                                }
                                            }
                                            Err(_) => break,
                                        }
                                    }
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Self {
            addr,
            connections,
            bytes_received,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}

impl Drop for TcpEchoBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// An address nothing listens on.
#[allow(dead_code)]
pub async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Knobs for [`BalancerHandle::spawn`].
#[allow(dead_code)]
pub struct BalancerOptions {
    /// Address the balancer listens on.
    pub listen_addr: String,
    pub backends: Vec<SocketAddr>,
    pub ip_filter: IpFilter,
    pub max_concurrent: usize,
    pub max_per_window: usize,
    pub window: Duration,
    pub acceptor: Acceptor,
    pub grace_period: Duration,
    /// Run one health check before accepting.
    pub initial_health_check: bool,
}

#[allow(dead_code)]
impl BalancerOptions {
    pub fn new(backends: Vec<SocketAddr>) -> Self {
        Self {
            listen_addr: "127.0.0.1:0".to_string(),
            backends,
            ip_filter: IpFilter::disabled(),
            max_concurrent: 100,
            max_per_window: 1000,
            window: Duration::from_secs(60),
            acceptor: Acceptor::Plain,
            grace_period: Duration::from_secs(2),
            initial_health_check: true,
        }
    }
}

#[allow(dead_code)]
pub struct BalancerHandle {
    pub listen_addr: SocketAddr,
    pub pool: Arc<ServerPool>,
    pub engine: Arc<ProxyEngine>,
    pub rate_limiter: Arc<RateLimiter>,
    pub stats: Arc<ConnectionStats>,
    pub tracker: ConnectionTracker,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<io::Result<()>>,
}

#[allow(dead_code)]
impl BalancerHandle {
    pub async fn spawn(options: BalancerOptions) -> io::Result<Self> {
        let pool = Arc::new(ServerPool::from_addresses(
            options.backends.iter().map(|a| a.to_string()),
        ));

        if options.initial_health_check {
            HealthChecker::new(Arc::clone(&pool), Duration::from_secs(60), DIAL_TIMEOUT)
                .check_servers()
                .await;
        }

        let engine = Arc::new(ProxyEngine::new(Arc::clone(&pool), DIAL_TIMEOUT));
        let rate_limiter = Arc::new(RateLimiter::new(
            options.max_concurrent,
            options.max_per_window,
            options.window,
        ));

        let listener = Listener::bind(&options.listen_addr, options.acceptor)
            .await
            .map_err(io::Error::other)?;
        let listen_addr = listener.local_addr()?;

        let supervisor = Supervisor::new(
            listener,
            Arc::new(options.ip_filter),
            Arc::clone(&rate_limiter),
            Arc::clone(&engine),
        )
        .with_grace_period(options.grace_period)
        .with_handshake_timeout(Duration::from_secs(2));

        let stats = supervisor.stats();
        let tracker = supervisor.tracker();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(supervisor.run(shutdown_rx));

        Ok(Self {
            listen_addr,
            pool,
            engine,
            rate_limiter,
            stats,
            tracker,
            shutdown_tx,
            task,
        })
    }

    /// Signal shutdown and wait for the accept loop to finish draining.
    pub async fn shutdown(self) -> io::Result<()> {
        let _ = self.shutdown_tx.send(true);
        timeout(Duration::from_secs(5), self.task)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "supervisor did not stop"))?
            .map_err(io::Error::other)?
    }
}

/// Poll `condition` every 10ms until it holds or `limit` passes.
#[allow(dead_code)]
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Connect, send `payload`, and read one response chunk.
#[allow(dead_code)]
pub async fn try_roundtrip(addr: SocketAddr, payload: &[u8]) -> Result<Vec<u8>, &'static str> {
    let result = timeout(Duration::from_secs(2), async {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(payload).await?;
        stream.flush().await?;
        let mut buf = vec![0u8; 64];
        let n = stream.read(&mut buf).await?;
        Ok::<_, io::Error>(buf[..n].to_vec())
    })
    .await;

    match result {
        Ok(Ok(data)) if !data.is_empty() => Ok(data),
        Ok(Ok(_)) => Err("connection closed"),
        Ok(Err(_)) => Err("io error"),
        Err(_) => Err("timeout"),
    }
}

/// Self-signed certificate written to disk for the TLS listener.
#[allow(dead_code)]
pub struct TlsFiles {
    _dir: TempDir,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub cert_der: Vec<u8>,
}

#[allow(dead_code)]
impl TlsFiles {
    pub fn generate(server_name: &str) -> io::Result<Self> {
        let cert = rcgen::generate_simple_self_signed(vec![server_name.to_string()])
            .map_err(io::Error::other)?;

        let dir = tempfile::tempdir()?;
        let cert_path = dir.path().join("server.crt");
        let key_path = dir.path().join("server.key");
        std::fs::write(&cert_path, cert.cert.pem())?;
        std::fs::write(&key_path, cert.key_pair.serialize_pem())?;

        Ok(Self {
            _dir: dir,
            cert_path,
            key_path,
            cert_der: cert.cert.der().to_vec(),
        })
    }

    pub fn acceptor(&self) -> io::Result<Acceptor> {
        let acceptor = load_acceptor(&self.cert_path, &self.key_path).map_err(io::Error::other)?;
        Ok(Acceptor::Tls(acceptor))
    }
}

#[allow(dead_code)]
pub async fn tls_client_connect(
    addr: SocketAddr,
    server_name: &str,
    cert_der: &[u8],
) -> io::Result<tokio_rustls::client::TlsStream<TcpStream>> {
    init_crypto_provider();

    let mut root_store = rustls::RootCertStore::empty();
    root_store
        .add(CertificateDer::from(cert_der.to_vec()))
        .map_err(io::Error::other)?;

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    let connector = TlsConnector::from(Arc::new(config));
    let stream = TcpStream::connect(addr).await?;
    let server_name = ServerName::try_from(server_name.to_string())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    connector.connect(server_name, stream).await
}
