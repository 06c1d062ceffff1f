//! Error types for the Jenkins mirror.

use thiserror::Error;

use crate::transport::Method;

/// Top-level error type for mirror operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The remote API answered a structured call with a non-2xx status.
    #[error("request ({method}) failed {status} {reason} for {url}")]
    RemoteRequestFailed {
        method: Method,
        status: u16,
        reason: String,
        url: String,
    },

    /// Connection-level fault that may succeed when retried.
    #[error("transient network failure for {url}: {reason}")]
    TransientNetwork { url: String, reason: String },

    /// A transient failure persisted through every retry attempt.
    #[error("request ({method}) for {url} failed after {attempts} attempts: {reason}")]
    RetriesExhausted {
        method: Method,
        url: String,
        attempts: u32,
        reason: String,
    },

    /// Non-retryable transport failure (DNS, refused connection, timeout, ...).
    #[error("request ({method}) for {url} could not be sent: {reason}")]
    Transport {
        method: Method,
        url: String,
        reason: String,
    },

    /// The remote side has not computed the requested value yet.
    #[error("{what} is not available yet for {url}")]
    NotYetAvailable { url: String, what: String },

    /// The mirrored data has no such key.
    #[error("key '{key}' not found in data of {url}")]
    KeyNotFound { url: String, key: String },

    /// The queue correlation heuristic could not pin down the submitted build.
    #[error("cannot locate submitted build of job '{job}': {reason}")]
    CannotLocateSubmittedBuild { job: String, reason: String },

    /// Progressive console headers were missing or malformed.
    #[error("console protocol error for {url}: {reason}")]
    ConsoleProtocol { url: String, reason: String },

    /// The console stream was already drained.
    #[error("no more console data for {url}")]
    NoMoreConsoleData { url: String },

    /// Two credential sets disagree on the username.
    #[error("conflicting credentials: username '{existing}' cannot be replaced by '{requested}'")]
    ConflictingCredentials { existing: String, requested: String },

    /// The entity was constructed from a bare URL and cannot reach its parent.
    #[error("{url} has no traversable parent")]
    Detached { url: String },

    /// A URL does not have the shape expected for the entity.
    #[error("invalid url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// An artifact destination would escape the target directory.
    #[error("invalid artifact path '{0}'")]
    InvalidArtifactPath(String),

    /// The response body could not be decoded.
    #[error("unexpected response from {url}: {reason}")]
    Decode { url: String, reason: String },

    /// A waiting loop was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error while writing artifacts or reading files.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns true if the error only means "ask again later".
    pub fn is_not_yet_available(&self) -> bool {
        matches!(self, Error::NotYetAvailable { .. })
    }
}

/// Result type alias for mirror operations.
pub type Result<T> = std::result::Result<T, Error>;
