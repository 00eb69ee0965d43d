//! Error types for clusterboot

use std::fmt;
use std::time::Duration;

/// Result type alias for clusterboot operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for clusterboot
///
/// A dependency that no node provides is not an error: resolution returns
/// [`crate::resolver::Resolved::Absent`] for that case. Only the wait barrier
/// aborts a run.
#[derive(Debug)]
pub enum Error {
    /// Membership directory could not be queried or written
    Directory(String),
    /// Configuration errors
    Config(String),
    /// IO errors
    Io(std::io::Error),
    /// Serialization errors
    Serialization(String),
    /// The local node is not present in the directory
    UnknownNode(String),
    /// Role tag that does not name a known role
    UnknownRole(String),
    /// A hard dependency never became reachable within the wait window
    TimeoutExceeded {
        service: String,
        expected: usize,
        observed: usize,
        waited: Duration,
    },
}

impl Error {
    /// Whether this error must halt the orchestration run for the node.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::TimeoutExceeded { .. })
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Directory(msg) => write!(f, "Directory error: {}", msg),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::UnknownNode(name) => write!(f, "Node not found in directory: {}", name),
            Error::UnknownRole(tag) => write!(f, "Unknown role: {}", tag),
            Error::TimeoutExceeded {
                service,
                expected,
                observed,
                waited,
            } => write!(
                f,
                "Timed out after {:?} waiting for service {}: {} of {} instances running",
                waited, service, observed, expected
            ),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
