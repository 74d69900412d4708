//! Per-client connection limits.
//!
//! Each client IP is capped on two axes: connections open at the same time,
//! and connections admitted within a trailing window (a sliding log of
//! admission instants).

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Default rate window.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct ClientStats {
    /// Admitted connections still open.
    concurrent: usize,
    /// Admission instants, oldest first.
    recent: VecDeque<Instant>,
}

impl ClientStats {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.recent.front() {
            if now.duration_since(oldest) > window {
                self.recent.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Admission control keyed by client IP.
#[derive(Debug)]
pub struct RateLimiter {
    clients: Mutex<HashMap<String, ClientStats>>,
    max_concurrent: usize,
    max_per_window: usize,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_concurrent: usize, max_per_window: usize, window: Duration) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            max_concurrent,
            max_per_window,
            window,
        }
    }

    /// Limiter with a one minute window.
    pub fn per_minute(max_concurrent: usize, max_per_minute: usize) -> Self {
        Self::new(max_concurrent, max_per_minute, DEFAULT_WINDOW)
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn clients(&self) -> MutexGuard<'_, HashMap<String, ClientStats>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Try to admit a connection from `ip`.
    ///
    /// Every `true` must be matched by exactly one [`done`](Self::done) when
    /// the connection ends. Prefer [`acquire`](Self::acquire), which does
    /// that on drop.
    pub fn allow(&self, ip: &str) -> bool {
        let now = Instant::now();
        let mut clients = self.clients();
        let stats = clients.entry(ip.to_string()).or_default();

        stats.prune(now, self.window);

        if stats.concurrent >= self.max_concurrent {
            debug!(
                ip,
                concurrent = stats.concurrent,
                limit = self.max_concurrent,
                "Concurrent connection limit reached"
            );
            return false;
        }

        if stats.recent.len() >= self.max_per_window {
            debug!(
                ip,
                recent = stats.recent.len(),
                limit = self.max_per_window,
                "Connection rate limit reached"
            );
            return false;
        }

        stats.concurrent += 1;
        stats.recent.push_back(now);
        true
    }

    /// Release one admitted connection for `ip`. Never goes below zero.
    pub fn done(&self, ip: &str) {
        if let Some(stats) = self.clients().get_mut(ip) {
            stats.concurrent = stats.concurrent.saturating_sub(1);
        }
    }

    /// Admit a connection and return a permit that releases it on drop.
    pub fn acquire(self: &Arc<Self>, ip: &str) -> Option<AdmissionPermit> {
        if self.allow(ip) {
            Some(AdmissionPermit {
                limiter: Arc::clone(self),
                ip: ip.to_string(),
            })
        } else {
            None
        }
    }

    /// Open admitted connections for `ip`.
    pub fn concurrent(&self, ip: &str) -> usize {
        self.clients().get(ip).map_or(0, |s| s.concurrent)
    }

    /// Number of client IPs currently tracked.
    pub fn tracked_clients(&self) -> usize {
        self.clients().len()
    }

    /// Drop clients with no open connections and nothing left in the window.
    ///
    /// Returns the number of entries removed.
    pub fn evict_idle(&self) -> usize {
        let now = Instant::now();
        let mut clients = self.clients();
        let before = clients.len();

        clients.retain(|_, stats| {
            stats.prune(now, self.window);
            stats.concurrent > 0 || !stats.recent.is_empty()
        });

        before - clients.len()
    }

    /// Spawn a loop that runs [`evict_idle`](Self::evict_idle) once per
    /// window until shutdown.
    pub fn start_eviction(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + self.window,
                self.window,
            );
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                if *shutdown.borrow() {
                    break;
                }

                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = self.evict_idle();
                        if evicted > 0 {
                            debug!(
                                evicted,
                                remaining = self.tracked_clients(),
                                "Evicted idle rate limit entries"
                            );
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }

            info!("Rate limiter eviction loop shutting down");
        })
    }
}

/// An admitted connection. Dropping it releases the concurrency slot.
#[derive(Debug)]
pub struct AdmissionPermit {
    limiter: Arc<RateLimiter>,
    ip: String,
}

impl AdmissionPermit {
    pub fn ip(&self) -> &str {
        &self.ip
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.limiter.done(&self.ip);
    }
}
