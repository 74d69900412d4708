//! Backend pool management.
//!
//! The pool is populated once at startup and its membership never changes
//! afterwards. Liveness is the only mutable state and each backend owns its
//! own flag, so health probes and dial outcomes for one backend never
//! contend with reads of another.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// A backend server traffic can be forwarded to.
#[derive(Debug)]
pub struct Backend {
    /// `host:port` address, also the backend's identity.
    address: String,
    /// Current liveness.
    alive: AtomicBool,
}

impl Backend {
    /// Create a backend. Backends start dead until probed.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            alive: AtomicBool::new(false),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Mark alive. Returns the previous state.
    pub fn mark_alive(&self) -> bool {
        self.alive.swap(true, Ordering::AcqRel)
    }

    /// Mark dead. Returns the previous state.
    pub fn mark_dead(&self) -> bool {
        self.alive.swap(false, Ordering::AcqRel)
    }
}

/// Ordered set of backends.
#[derive(Debug, Default)]
pub struct ServerPool {
    servers: RwLock<Vec<Arc<Backend>>>,
}

impl ServerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a pool from addresses, keeping their order.
    pub fn from_addresses<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let pool = Self::new();
        for address in addresses {
            pool.add_server(address);
        }
        pool
    }

    /// Append a backend. Intended for construction only.
    pub fn add_server(&self, address: impl Into<String>) -> Arc<Backend> {
        let backend = Arc::new(Backend::new(address));
        self.servers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&backend));
        backend
    }

    /// Snapshot of the pool members in insertion order.
    ///
    /// The handles are shared with the pool, so liveness read through them
    /// is always current.
    pub fn list_servers(&self) -> Vec<Arc<Backend>> {
        self.servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of backends currently marked alive.
    pub fn count_alive(&self) -> usize {
        self.servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|b| b.is_alive())
            .count()
    }

    pub fn len(&self) -> usize {
        self.servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Open a TCP connection to `address`, giving up after `connect_timeout`.
pub async fn connect(address: &str, connect_timeout: Duration) -> io::Result<TcpStream> {
    debug!(backend_addr = %address, "Connecting to backend");

    match timeout(connect_timeout, TcpStream::connect(address)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
    }
}
