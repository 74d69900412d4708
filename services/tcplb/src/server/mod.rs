//! Client-facing side of the balancer.
//!
//! ```text
//! accept -> IpFilter -> RateLimiter -> TLS handshake -> ProxyEngine
//!    |                                                     |
//!    +---------------- ConnectionTracker <-----------------+
//! ```
//!
//! Shutdown stops the accept loop, force-closes every tracked connection
//! and waits, bounded by a grace period, for their tasks to exit.

mod listener;
mod supervisor;
mod tls;
mod tracker;

pub use listener::{client_ip, normalize_listen_addr, Acceptor, ClientStream, Listener};
pub use supervisor::{
    ConnectionStats, Incoming, Supervisor, DEFAULT_GRACE_PERIOD, DEFAULT_HANDSHAKE_TIMEOUT,
};
pub use tls::{load_acceptor, load_certs, load_private_key};
pub use tracker::{ConnectionGuard, ConnectionTracker};
