//! Load balancer configuration.
//!
//! Read from a JSON file. Every field except `servers` has a default, and
//! `servers` may be empty (every connection is then closed right away).
//! Unknown keys are ignored. Numeric settings that are zero or negative fall
//! back to their defaults instead of failing startup.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::SetupError;

/// The only balancing algorithm implemented.
pub const ROUND_ROBIN: &str = "round_robin";

const DEFAULT_HEALTH_CHECK_INTERVAL: i64 = 10;
const DEFAULT_REQUEST_TIMEOUT: i64 = 5;
const DEFAULT_MAX_CONCURRENT: i64 = 100;
const DEFAULT_MAX_PER_MINUTE: i64 = 600;
const DEFAULT_SHUTDOWN_GRACE_PERIOD: i64 = 5;

/// One backend entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerEntry {
    /// `host:port` of the backend.
    pub address: String,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Validated configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address to listen on. `:port` binds all interfaces.
    pub listen_addr: String,

    /// Balancing algorithm name.
    pub algorithm: String,

    /// Seconds between health check sweeps.
    pub health_check_interval: i64,

    /// Seconds allowed for backend dials, health probes and client TLS
    /// handshakes.
    pub request_timeout: i64,

    /// Open connections allowed per client IP.
    pub max_concurrent_connections: i64,

    /// Connections admitted per client IP per rolling minute.
    pub max_connections_per_minute: i64,

    /// `allow`, `deny` or `none`. Anything else disables filtering.
    pub ip_filter_mode: String,

    /// IPs the filter mode applies to.
    pub ip_filter_list: Vec<String>,

    /// Terminate TLS on the listener.
    pub accept_tls: bool,

    /// PEM certificate chain, required with `accept_tls`.
    pub tls_cert_file: Option<PathBuf>,

    /// PEM private key, required with `accept_tls`.
    pub tls_key_file: Option<PathBuf>,

    /// Seconds to wait for connections to finish during shutdown.
    pub shutdown_grace_period: i64,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Backends in rotation order.
    pub servers: Vec<ServerEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: ":8080".to_string(),
            algorithm: ROUND_ROBIN.to_string(),
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_concurrent_connections: DEFAULT_MAX_CONCURRENT,
            max_connections_per_minute: DEFAULT_MAX_PER_MINUTE,
            ip_filter_mode: "none".to_string(),
            ip_filter_list: Vec::new(),
            accept_tls: false,
            tls_cert_file: None,
            tls_key_file: None,
            shutdown_grace_period: DEFAULT_SHUTDOWN_GRACE_PERIOD,
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
            servers: Vec::new(),
        }
    }
}

impl Config {
    /// Read, parse and validate a config file.
    pub fn load(path: &Path) -> Result<Self, SetupError> {
        let raw = fs::read_to_string(path).map_err(|source| SetupError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config = Self::from_json(&raw)?;

        if let Ok(level) = std::env::var("TCPLB_LOG_LEVEL") {
            config.log_level = level;
        }

        Ok(config)
    }

    /// Parse and validate JSON.
    pub fn from_json(raw: &str) -> Result<Self, SetupError> {
        let mut config: Config = serde_json::from_str(raw)?;
        config.apply_defaults();
        config.validate()?;
        Ok(config)
    }

    /// Fill in blank strings and non-positive numbers the way missing
    /// fields are filled.
    fn apply_defaults(&mut self) {
        let defaults = Config::default();

        for (value, default) in [
            (&mut self.health_check_interval, defaults.health_check_interval),
            (&mut self.request_timeout, defaults.request_timeout),
            (
                &mut self.max_concurrent_connections,
                defaults.max_concurrent_connections,
            ),
            (
                &mut self.max_connections_per_minute,
                defaults.max_connections_per_minute,
            ),
            (&mut self.shutdown_grace_period, defaults.shutdown_grace_period),
        ] {
            if *value <= 0 {
                *value = default;
            }
        }

        if self.listen_addr.trim().is_empty() {
            self.listen_addr = defaults.listen_addr;
        }
        if self.algorithm.trim().is_empty() {
            self.algorithm = defaults.algorithm;
        }
        if self.log_level.trim().is_empty() {
            self.log_level = defaults.log_level;
        }
    }

    /// Check value ranges and cross-field requirements.
    ///
    /// The IP filter mode is deliberately not checked: unknown modes fail
    /// open at runtime.
    pub fn validate(&self) -> Result<(), SetupError> {
        let invalid = |msg: String| Err(SetupError::ConfigInvalid(msg));

        if self.algorithm.trim().to_ascii_lowercase() != ROUND_ROBIN {
            return invalid(format!(
                "unsupported algorithm {:?} (supported: {ROUND_ROBIN})",
                self.algorithm
            ));
        }

        for (name, value) in [
            ("health_check_interval", self.health_check_interval),
            ("request_timeout", self.request_timeout),
            ("shutdown_grace_period", self.shutdown_grace_period),
            ("max_concurrent_connections", self.max_concurrent_connections),
            ("max_connections_per_minute", self.max_connections_per_minute),
        ] {
            if value <= 0 {
                return invalid(format!("{name} must be at least 1"));
            }
        }

        if self.accept_tls && (self.tls_cert_file.is_none() || self.tls_key_file.is_none()) {
            return invalid("accept_tls requires tls_cert_file and tls_key_file".to_string());
        }

        for server in &self.servers {
            validate_backend_address(&server.address)?;
        }

        Ok(())
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(positive(self.health_check_interval, DEFAULT_HEALTH_CHECK_INTERVAL))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(positive(self.request_timeout, DEFAULT_REQUEST_TIMEOUT))
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(positive(self.shutdown_grace_period, DEFAULT_SHUTDOWN_GRACE_PERIOD))
    }

    pub fn max_concurrent_connections(&self) -> usize {
        positive(self.max_concurrent_connections, DEFAULT_MAX_CONCURRENT) as usize
    }

    pub fn max_connections_per_minute(&self) -> usize {
        positive(self.max_connections_per_minute, DEFAULT_MAX_PER_MINUTE) as usize
    }

    /// Backend addresses in rotation order.
    pub fn server_addresses(&self) -> Vec<String> {
        self.servers
            .iter()
            .map(|s| s.address.trim().to_string())
            .collect()
    }
}

fn positive(value: i64, default: i64) -> u64 {
    u64::try_from(value)
        .ok()
        .filter(|v| *v > 0)
        .unwrap_or(default.unsigned_abs())
}

/// A backend address must be `host:port` with a non-empty host.
fn validate_backend_address(address: &str) -> Result<(), SetupError> {
    let address = address.trim();
    let valid = address
        .rsplit_once(':')
        .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok_and(|p| p > 0))
        .unwrap_or(false);

    if valid {
        Ok(())
    } else {
        Err(SetupError::ConfigInvalid(format!(
            "invalid backend address {address:?} (expected host:port)"
        )))
    }
}
