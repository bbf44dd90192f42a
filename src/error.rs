//! Error types for Saiga.

use thiserror::Error;

/// Result type alias using Saiga's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Saiga operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Memory allocation from a region failed.
    #[error("memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Invalid shared region operation.
    #[error("invalid shared region: {0}")]
    InvalidRegion(String),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}
