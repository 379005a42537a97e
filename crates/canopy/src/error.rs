//! Error types for canopy

use std::sync::Arc;
use thiserror::Error;

/// Terminal reason a context stopped being active
///
/// Reported by [`Context::err`](crate::Context::err) once the context's
/// [`Done`](crate::Done) signal has fired. A reason propagated from an
/// ancestor is copied down unchanged.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextError {
    /// The context was released through its cancel handle
    #[error("context canceled")]
    Canceled,

    /// The context's deadline passed before it was released
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

impl ContextError {
    /// Whether this reason came from a timer rather than an explicit cancel
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::DeadlineExceeded)
    }

    /// Deadline expiry is transient: retrying with a fresh deadline may succeed
    pub fn is_temporary(&self) -> bool {
        self.is_timeout()
    }
}

/// Underlying cause attached to a settled context
///
/// Defaults to the node's [`ContextError`]; contexts built with
/// [`with_cancel_cause`](crate::with_cancel_cause) can carry any error.
pub type Cause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Unified error type for canopy construction and configuration
#[derive(Error, Debug)]
pub enum CanopyError {
    // Value-node construction
    #[error("Invalid context key: {0}")]
    InvalidKey(String),

    // Configuration
    #[error("Configuration error: {0}")]
    Config(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using CanopyError
pub type Result<T> = std::result::Result<T, CanopyError>;
