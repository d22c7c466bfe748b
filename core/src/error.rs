//! Error types shared between the manager client and the worker runtime.

/// Error type for manager client operations.
///
/// Everything in here is a transport-level failure from the worker's point of
/// view: the caller decides whether it is recoverable (fetch, update dispatch)
/// or fatal (registration).
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Connection, timeout or protocol error from the HTTP stack.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The manager answered with an unexpected status code.
    #[error("manager returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The configured or discovered manager URL is not usable.
    #[error("invalid manager URL: {0}")]
    InvalidUrl(String),
}

impl CoreError {
    /// Whether the manager rejected our credentials.
    ///
    /// A 401 during sign-on means the stored identity is stale and the worker
    /// should re-register; anywhere else it is just another failed call.
    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            CoreError::Status {
                status: reqwest::StatusCode::UNAUTHORIZED,
                ..
            }
        )
    }
}

/// Result type alias for client operations.
pub type CoreResult<T> = std::result::Result<T, CoreError>;
