//! Per-client IP allow/deny policy.
//!
//! Unrecognized mode strings fail open: the filter admits everyone and logs
//! a warning when it is built. This is a security-relevant default; a typo
//! in the configured mode disables filtering rather than blocking traffic.

use std::collections::HashSet;
use std::fmt;

use tracing::{debug, warn};

/// Filtering mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterMode {
    /// Only listed IPs are admitted.
    Allow,
    /// Listed IPs are rejected, everyone else admitted.
    Deny,
    /// Filtering disabled.
    None,
    /// Any other configured value. Treated like [`FilterMode::None`].
    Unrecognized(String),
}

impl FilterMode {
    /// Parse a configured mode, case-insensitively.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "allow" => FilterMode::Allow,
            "deny" => FilterMode::Deny,
            "none" | "" => FilterMode::None,
            other => FilterMode::Unrecognized(other.to_string()),
        }
    }
}

impl fmt::Display for FilterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterMode::Allow => f.write_str("allow"),
            FilterMode::Deny => f.write_str("deny"),
            FilterMode::None => f.write_str("none"),
            FilterMode::Unrecognized(raw) => write!(f, "unrecognized({raw})"),
        }
    }
}

/// Immutable allow/deny decision over client IP strings.
#[derive(Debug, Clone)]
pub struct IpFilter {
    mode: FilterMode,
    list: HashSet<String>,
}

impl IpFilter {
    pub fn new<I, S>(mode: FilterMode, list: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let list: HashSet<String> = list
            .into_iter()
            .map(|ip| ip.as_ref().trim().to_string())
            .filter(|ip| !ip.is_empty())
            .collect();

        if let FilterMode::Unrecognized(raw) = &mode {
            warn!(
                mode = %raw,
                listed = list.len(),
                "Unknown ip filter mode, defaulting to allow-all"
            );
        }

        Self { mode, list }
    }

    /// Build from the raw configured mode string.
    pub fn from_config<I, S>(mode: &str, list: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::new(FilterMode::parse(mode), list)
    }

    /// Filter that admits everyone.
    pub fn disabled() -> Self {
        Self {
            mode: FilterMode::None,
            list: HashSet::new(),
        }
    }

    pub fn mode(&self) -> &FilterMode {
        &self.mode
    }

    /// Whether a client with this IP may connect.
    pub fn allow(&self, ip: &str) -> bool {
        let ip = ip.trim();

        if self.list.is_empty() {
            return true;
        }

        match self.mode {
            FilterMode::Allow => {
                let allowed = self.list.contains(ip);
                if !allowed {
                    debug!(ip, "Not on allowlist");
                }
                allowed
            }
            FilterMode::Deny => {
                let denied = self.list.contains(ip);
                if denied {
                    debug!(ip, "On denylist");
                }
                !denied
            }
            FilterMode::None | FilterMode::Unrecognized(_) => true,
        }
    }
}
