//! Error types for Iris.

use thiserror::Error;

/// Result type alias using Iris's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Iris operations.
#[derive(Error, Debug)]
pub enum Error {
    /// `init` was called on an already-initialized interface.
    #[error("interface already initialized")]
    AlreadyInitialized,

    /// An operation was attempted before `init` completed successfully.
    #[error("interface not initialized")]
    NotInitialized,

    /// The algorithm module declares an ABI version the adapter cannot drive.
    #[error("incompatible ABI version: expected {expected}, got {actual}")]
    IncompatibleAbi {
        /// ABI version the adapter was built against.
        expected: u32,
        /// ABI version the module declares.
        actual: u32,
    },

    /// A buffer id in a `map_buffers` batch collides with a mapped buffer.
    #[error("buffer {0} is already mapped")]
    DuplicateBuffer(u32),

    /// A buffer id is not currently mapped.
    #[error("buffer {0} is not mapped")]
    UnknownBuffer(u32),

    /// The isolated algorithm peer is gone or the channel to it is broken.
    #[error("algorithm peer unavailable")]
    PeerUnavailable,

    /// An envelope failed to decode.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// A bounded wait expired.
    #[error("operation timed out")]
    Timeout,

    /// No algorithm module matched the requested name.
    #[error("IPA module '{0}' not found")]
    ModuleNotFound(String),

    /// An algorithm module binary could not be loaded.
    #[error("failed to load IPA module: {0}")]
    LoadFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}
