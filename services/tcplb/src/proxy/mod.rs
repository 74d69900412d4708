//! L4 load balancing: backend pool, selection and forwarding.
//!
//! ## Architecture
//!
//! ```text
//! client stream -> ProxyEngine -> RoundRobin -> ServerPool -> Backend
//!                      |              (failover, then recovery scan)
//!                      +-> proxy_bidirectional(client, backend)
//! ```
//!
//! The health checker updates backend liveness in the background; every
//! selection re-reads liveness at use time.

mod backend;
mod engine;
mod forward;
mod round_robin;

pub use backend::{connect, Backend, ServerPool};
pub use engine::{ProxyEngine, ProxyStats};
pub use forward::{proxy_bidirectional, ForwardStats};
pub use round_robin::RoundRobin;
