//! Error types for tunnel setup.
//!
//! Everything here aborts a `connect` before a transport process exists.
//! Once a process is launched its end is described by
//! [`ClosureReason`](crate::supervisor::ClosureReason), never by an error.

use thiserror::Error;

/// Main error type for dbtunnel operations
#[derive(Error, Debug)]
pub enum TunnelError {
    /// Database identifier (or one of its parts) is malformed
    #[error("invalid database identifier '{0}': {1}")]
    InvalidIdentifier(String, String),

    /// No directory entry exists for the canonical name
    #[error("database '{0}' not found in directory")]
    DatabaseNotFound(String),

    /// Directory entry exists but lacks fields required to open a tunnel
    #[error("directory entry for '{0}' is incomplete: {1}")]
    IncompleteRecord(String, String),

    /// Directory could not be read (not the same as "not found")
    #[error("directory read failed for '{0}': {1}")]
    Directory(String, String),

    /// Identity has no valid session, even after one renewal attempt
    #[error("identity '{0}' is not authenticated: {1}")]
    Unauthenticated(String, String),

    /// Requested local port cannot be listened on (port 0 lets the OS pick)
    #[error("invalid local port {0}: choose a port between 1 and 65535")]
    InvalidPort(u16),

    /// Explicitly requested local port is already bound
    #[error("local port {0} is already in use")]
    PortInUse(u16),

    /// No free port found while searching upward from the engine default
    #[error("no free local port in {attempts} attempts starting at {start}")]
    PortExhausted { start: u16, attempts: u16 },

    /// Invalid configuration in a named section
    #[error("invalid config in [{0}]: {1}")]
    InvalidConfig(String, String),
}

/// Result type alias for dbtunnel operations
pub type Result<T> = std::result::Result<T, TunnelError>;
