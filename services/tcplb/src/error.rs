//! Error types for the load balancer.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Per-connection failures. None of these are fatal to the process; the
/// client connection is closed and the balancer keeps serving.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The pool has no members at all.
    #[error("no servers configured")]
    NoServersConfigured,

    /// Round-robin found nothing alive and the recovery scan found nothing
    /// reachable either.
    #[error("no alive backend available")]
    NoAliveBackend,

    /// Every failover attempt dialed a backend that refused or timed out.
    #[error("all backend connection attempts failed ({attempts} attempts)")]
    AllAttemptsFailed { attempts: usize },

    /// TLS handshake with the client failed or timed out.
    #[error("client handshake failed: {0}")]
    Handshake(io::Error),
}

impl ProxyError {
    /// Short stable code used as a log field.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ProxyError::NoServersConfigured => "no_servers_configured",
            ProxyError::NoAliveBackend => "no_alive_backend",
            ProxyError::AllAttemptsFailed { .. } => "all_attempts_failed",
            ProxyError::Handshake(_) => "handshake_failed",
        }
    }
}

/// Startup failures. These abort the process before any traffic is served.
#[derive(Debug, Error)]
pub enum SetupError {
    /// Could not read the configuration file.
    #[error("cannot read config file {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Configuration is not valid JSON or has the wrong shape.
    #[error("invalid config format: {0}")]
    ConfigParse(#[from] serde_json::Error),

    /// Configuration parsed but a value is out of range.
    #[error("invalid config: {0}")]
    ConfigInvalid(String),

    /// Certificate or key could not be loaded.
    #[error("tls setup failed for {path}: {detail}")]
    Tls { path: PathBuf, detail: String },

    /// Listener could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
}
