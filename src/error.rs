use thiserror::Error;

/// Startup configuration problems. Fatal: the process exits before serving.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Failures talking to the comment store.
///
/// None of these ever carry the access token: it lives only in the client's
/// default headers.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("comment store returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("access token is not a valid header value")]
    InvalidToken,
    #[error("comment store request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("comment store response could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Per-request failures. Mapped to an HTTP status once, in `api`.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("{0}")]
    InvalidInput(&'static str),
    #[error("too many posts, try again later")]
    RateLimited,
    #[error(transparent)]
    Upstream(#[from] StoreError),
}
