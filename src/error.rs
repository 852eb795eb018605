//! Error types for Quarry
//!
//! Defines a unified error type that can represent failures from all
//! components: connection handling, SQL execution, chunk planning, the
//! external store and the orchestrator itself.

use std::fmt;
use std::io;

/// Unified error type for Quarry operations
#[derive(Debug)]
pub enum QuarryError {
    /// I/O error (artifact files, temp files)
    Io(io::Error),
    /// Error returned by the server or the client driver
    Sql(String),
    /// Invalid or inconsistent configuration
    Config(String),
    /// Consistency regime violation (lost lock connection, bad state)
    Consistency(String),
    /// Chunk planning error (bad keys, unusable region data)
    Chunk(String),
    /// External storage error
    Storage(String),
    /// The dump was canceled before it completed
    Canceled,
    /// Generic internal error
    Internal(String),
}

impl QuarryError {
    /// Create a chunk planning error for an unusable split key
    pub fn bad_split_key(database: &str, table: &str, reason: &str) -> Self {
        QuarryError::Chunk(format!(
            "cannot split `{}`.`{}` into chunks: {}",
            database, table, reason
        ))
    }

    /// Create a consistency error for a dead lock-holding connection
    pub fn lock_connection_lost(cause: &str) -> Self {
        QuarryError::Consistency(format!(
            "the connection holding table locks is no longer alive: {}",
            cause
        ))
    }

    /// True if the error came from a SQL connection and a worker may try to
    /// rebuild its connection before giving up on the chunk.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, QuarryError::Sql(_))
    }
}

impl fmt::Display for QuarryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuarryError::Io(e) => write!(f, "{}", e),
            QuarryError::Sql(msg) => write!(f, "{}", msg),
            QuarryError::Config(msg) => write!(f, "{}", msg),
            QuarryError::Consistency(msg) => write!(f, "{}", msg),
            QuarryError::Chunk(msg) => write!(f, "{}", msg),
            QuarryError::Storage(msg) => write!(f, "{}", msg),
            QuarryError::Canceled => write!(f, "dump canceled"),
            QuarryError::Internal(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for QuarryError {}

impl From<io::Error> for QuarryError {
    fn from(e: io::Error) -> Self {
        QuarryError::Io(e)
    }
}

impl From<mysql_async::Error> for QuarryError {
    fn from(e: mysql_async::Error) -> Self {
        QuarryError::Sql(e.to_string())
    }
}

impl From<serde_json::Error> for QuarryError {
    fn from(e: serde_json::Error) -> Self {
        QuarryError::Config(e.to_string())
    }
}

/// Result type alias for Quarry operations
pub type Result<T> = std::result::Result<T, QuarryError>;
