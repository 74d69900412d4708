//! Periodic TCP health checks for the backend pool.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::proxy::{connect, ServerPool};

/// Probes every backend on a fixed interval and updates its liveness.
pub struct HealthChecker {
    pool: Arc<ServerPool>,
    interval: Duration,
    timeout: Duration,
}

impl HealthChecker {
    pub fn new(pool: Arc<ServerPool>, interval: Duration, timeout: Duration) -> Self {
        Self {
            pool,
            interval,
            timeout,
        }
    }

    /// Probe every backend once, in pool order.
    ///
    /// A backend is alive if a TCP connection can be opened within the
    /// timeout; the probe connection is closed immediately.
    pub async fn check_servers(&self) {
        let servers = self.pool.list_servers();
        info!(total = servers.len(), "Health check started");

        for backend in &servers {
            match connect(backend.address(), self.timeout).await {
                Ok(stream) => {
                    drop(stream);
                    let was_alive = backend.mark_alive();
                    if !was_alive {
                        info!(backend_addr = %backend.address(), "Backend is now alive");
                    }
                    info!(backend_addr = %backend.address(), alive = true, "Health check result");
                }
                Err(e) => {
                    let was_alive = backend.mark_dead();
                    if was_alive {
                        warn!(backend_addr = %backend.address(), error = %e, "Backend is now dead");
                    }
                    info!(
                        backend_addr = %backend.address(),
                        alive = false,
                        error = %e,
                        "Health check result"
                    );
                }
            }
        }

        info!(
            alive = self.pool.count_alive(),
            total = servers.len(),
            "Health check completed"
        );
    }

    /// Spawn the periodic check loop.
    ///
    /// The first periodic check runs one interval from now; callers run
    /// [`check_servers`](Self::check_servers) themselves before starting so
    /// health data exists before any traffic is forwarded. Checks run one
    /// after another, so a slow sweep delays the next tick rather than
    /// overlapping it.
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_secs = self.interval.as_secs_f64(),
                timeout_secs = self.timeout.as_secs_f64(),
                "Starting health check loop"
            );

            let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                if *shutdown.borrow() {
                    break;
                }

                tokio::select! {
                    _ = ticker.tick() => self.check_servers().await,
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            // Sender gone: nobody can ask us to stop anymore.
                            break;
                        }
                    }
                }
            }

            info!("Health check loop shutting down");
        })
    }
}
