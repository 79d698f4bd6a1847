//! Error types for Tandem.

use thiserror::Error;

/// Result type alias using Tandem's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Tandem operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or missing configuration: bad sizes, a missing model file,
    /// a missing environment activate script. Fatal during initialization.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Shared-memory arena failure: creation, growth, or mapping.
    #[error("arena failure: {0}")]
    Arena(String),

    /// The stub process is gone or unresponsive.
    #[error("{0}")]
    StubLost(String),

    /// The model reported an error for a single request.
    #[error("{0}")]
    ModelRequest(String),

    /// The model reported a batch-level error.
    #[error("{0}")]
    ModelBatch(String),

    /// Failed to marshal a request or unmarshal a response.
    #[error("marshaling failure: {0}")]
    Marshal(String),

    /// The input cannot be carried through the shared arena.
    #[error("unsupported input: {0}")]
    Unsupported(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}
