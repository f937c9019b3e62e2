//! Error types for token management

/// Errors returned by `TokenManager`.
///
/// `Clone` so every caller coalesced onto one refresh receives the same error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid decode destination: {0}")]
    InvalidDestination(String),

    #[error("token store error: {0}")]
    Store(String),

    #[error("gateway rejected request: code {code}: {message}")]
    UpstreamAuth { code: i64, message: String },

    #[error(
        "token invalidated {attempts} times without a working replacement (last code {code}: {message})"
    )]
    AuthExhausted {
        attempts: u32,
        code: i64,
        message: String,
    },

    #[error("probe gave up after {attempts} attempts (last code {code}: {message})")]
    RetryExhausted {
        attempts: u32,
        code: i64,
        message: String,
    },

    #[error("operation cancelled")]
    Cancelled,
}

impl From<fxiaoke_auth::Error> for Error {
    fn from(err: fxiaoke_auth::Error) -> Self {
        match err {
            fxiaoke_auth::Error::Transport(msg) => Error::Transport(msg),
            fxiaoke_auth::Error::InvalidDestination(msg) => Error::InvalidDestination(msg),
            fxiaoke_auth::Error::Store(msg) => Error::Store(msg),
        }
    }
}

/// Result alias for token management.
pub type Result<T> = std::result::Result<T, Error>;
