//! tcplb: an L4 TCP/TLS load balancer.
//!
//! Clients are admitted by IP policy and per-client rate limits, then
//! relayed byte-for-byte to a backend chosen by round-robin over the
//! backends the health checker currently considers alive.

pub mod admission;
pub mod config;
pub mod error;
pub mod health;
pub mod logging;
pub mod proxy;
pub mod server;

pub use admission::{AdmissionPermit, FilterMode, IpFilter, RateLimiter};
pub use config::{Config, LogFormat};
pub use error::{ProxyError, SetupError};
pub use health::HealthChecker;
pub use proxy::{Backend, ForwardStats, ProxyEngine, RoundRobin, ServerPool};
pub use server::{Acceptor, ClientStream, ConnectionTracker, Listener, Supervisor};
