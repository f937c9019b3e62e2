//! Error types for gateway and store operations

/// Errors from a single gateway exchange or store operation.
///
/// Upstream business errors are not represented here: a response with a
/// nonzero `errorCode` is still a successful exchange and is returned as an
/// `UpstreamResponse` for the caller to classify.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid decode destination: {0}")]
    InvalidDestination(String),

    #[error("token store error: {0}")]
    Store(String),
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
