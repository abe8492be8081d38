//! Shared value types for the client domain.
//!
//! Unlike the newtype identifiers in [`crate::identifiers`], these types carry
//! meaningful values and participate in protocol decisions. A server address
//! has a non-empty host and a non-zero port. Progress is stored as the worker
//! reported it; only its fraction is clamped to 1.0.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Port a job server listens on unless configured otherwise.
pub const DEFAULT_PORT: u16 = 4730;

/// Host used when a server entry omits one.
pub const DEFAULT_HOST: &str = "localhost";

// ---------------------------------------------------------------------------
// Submission options
// ---------------------------------------------------------------------------

/// Queue priority requested for a job.
///
/// Selects which `SUBMIT_JOB*` packet variant is written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Runs after every queued normal and high priority job.
    Low,
    /// The server's default queue.
    #[default]
    Normal,
    /// Runs before every queued normal and low priority job.
    High,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            other => Err(format!("unknown priority '{other}' (expected low, normal or high)")),
        }
    }
}

// ---------------------------------------------------------------------------
// Server addresses
// ---------------------------------------------------------------------------

/// Network location of one job server.
///
/// Missing fields in configuration documents fall back to
/// [`DEFAULT_HOST`] and [`DEFAULT_PORT`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerAddress {
    /// Host name or IP literal.
    #[serde(default = "default_host")]
    pub host: String,
    /// TCP port.
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl ServerAddress {
    /// Creates an address from its parts.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Default for ServerAddress {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}

impl std::fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl std::str::FromStr for ServerAddress {
    type Err = String;

    /// Parses `host`, `host:port` or `:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|e| format!("invalid port in '{s}': {e}"))?;
                let host = if host.is_empty() { DEFAULT_HOST } else { host };
                Ok(Self::new(host, port))
            }
            None if s.is_empty() => Err("empty server address".to_string()),
            None => Ok(Self::new(s, DEFAULT_PORT)),
        }
    }
}

// ---------------------------------------------------------------------------
// Progress and status
// ---------------------------------------------------------------------------

/// Completion fraction reported by a worker as `numerator / denominator`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Progress {
    /// Units of work done.
    pub numerator: u64,
    /// Total units of work; `0` means unknown.
    pub denominator: u64,
}

impl Progress {
    /// Creates a progress value.
    pub fn new(numerator: u64, denominator: u64) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    /// Returns the fraction done in `[0.0, 1.0]`, or `None` when the total is unknown.
    pub fn fraction(self) -> Option<f64> {
        if self.denominator == 0 {
            None
        } else {
            Some((self.numerator as f64 / self.denominator as f64).min(1.0))
        }
    }
}

impl std::fmt::Display for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}

/// Snapshot carried by a `STATUS_RES` packet in answer to `GET_STATUS`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Whether the server still knows the job.
    pub known: bool,
    /// Whether a worker is currently running it.
    pub running: bool,
    /// Last progress the worker reported.
    pub progress: Progress,
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// A UTC wall-clock timestamp.
///
/// Wraps [`chrono::DateTime<Utc>`] so callers never depend on `chrono` types
/// directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Returns the current UTC time as a [`Timestamp`].
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Returns the underlying [`DateTime<Utc>`].
    pub fn as_datetime(self) -> DateTime<Utc> {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}
