//! In-flight connection tracking for shutdown.
//!
//! - Every accepted connection registers and gets a guard
//! - Shutdown signals every registered connection to close
//! - Draining waits until every guard has been dropped

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{oneshot, Notify};
use tracing::debug;

struct TrackedConnection {
    peer: SocketAddr,
    close_tx: Option<oneshot::Sender<()>>,
}

struct TrackerState {
    next_id: AtomicU64,
    closing: AtomicBool,
    connections: Mutex<HashMap<u64, TrackedConnection>>,
    drained: Notify,
}

impl TrackerState {
    fn connections(&self) -> MutexGuard<'_, HashMap<u64, TrackedConnection>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Concurrent set of open connections.
#[derive(Clone)]
pub struct ConnectionTracker {
    inner: Arc<TrackerState>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TrackerState {
                next_id: AtomicU64::new(1),
                closing: AtomicBool::new(false),
                connections: Mutex::new(HashMap::new()),
                drained: Notify::new(),
            }),
        }
    }

    /// Register a connection. Returns `None` once shutdown has begun.
    pub fn register(&self, peer: SocketAddr) -> Option<ConnectionGuard> {
        let mut connections = self.inner.connections();
        // Checked under the lock so close_all cannot miss this entry.
        if self.inner.closing.load(Ordering::SeqCst) {
            return None;
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (close_tx, close_rx) = oneshot::channel();
        connections.insert(
            id,
            TrackedConnection {
                peer,
                close_tx: Some(close_tx),
            },
        );

        Some(ConnectionGuard {
            id,
            state: Arc::clone(&self.inner),
            close_rx,
        })
    }

    /// Number of registered connections.
    pub fn active(&self) -> usize {
        self.inner.connections().len()
    }

    pub fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::SeqCst)
    }

    /// Refuse new registrations and tell every open connection to close.
    ///
    /// Returns how many connections were signalled.
    pub fn close_all(&self) -> usize {
        let mut connections = self.inner.connections();
        self.inner.closing.store(true, Ordering::SeqCst);

        let mut signalled = 0;
        for (id, conn) in connections.iter_mut() {
            if let Some(tx) = conn.close_tx.take() {
                debug!(conn_id = id, peer = %conn.peer, "Force-closing connection");
                let _ = tx.send(());
                signalled += 1;
            }
        }
        signalled
    }

    /// Wait until every connection guard is dropped, up to `timeout`.
    ///
    /// Returns `true` if fully drained.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.inner.drained.notified();
                if self.active() == 0 {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Held by a connection task for its whole lifetime.
pub struct ConnectionGuard {
    id: u64,
    state: Arc<TrackerState>,
    close_rx: oneshot::Receiver<()>,
}

impl ConnectionGuard {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Resolves when the tracker asks this connection to close.
    pub async fn closed(&mut self) {
        // A dropped sender also means close.
        let _ = (&mut self.close_rx).await;
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let remaining = {
            let mut connections = self.state.connections();
            connections.remove(&self.id);
            connections.len()
        };

        if remaining == 0 {
            self.state.drained.notify_waiters();
        }
    }
}
