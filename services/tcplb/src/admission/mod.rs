//! Connection admission: IP policy first, then per-client rate limits.

mod ip_filter;
mod rate_limit;

pub use ip_filter::{FilterMode, IpFilter};
pub use rate_limit::{AdmissionPermit, RateLimiter, DEFAULT_WINDOW};
