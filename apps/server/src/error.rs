use serde::{Deserialize, Serialize};

/// Error codes surfaced to clients in `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Unauth,
    RateLimit,
    BadRequest,
    ServerError,
}

/// Close codes (1000 + 4000-range for application-level).
pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_SUPERSEDED: u16 = 4001;
pub const CLOSE_POLICY: u16 = 4008;
pub const CLOSE_SERVER_ERROR: u16 = 4011;

/// Reason a connection is being torn down by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// A newer connection for the same user took over.
    Superseded,
    /// The outbound queue exceeded its high-water mark.
    Backpressure,
    /// Fatal internal error.
    ServerError,
}

impl CloseReason {
    pub fn code(self) -> u16 {
        match self {
            CloseReason::Superseded => CLOSE_SUPERSEDED,
            CloseReason::Backpressure => CLOSE_POLICY,
            CloseReason::ServerError => CLOSE_SERVER_ERROR,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            CloseReason::Superseded => "superseded",
            CloseReason::Backpressure => "outbound queue overflow",
            CloseReason::ServerError => "internal error",
        }
    }
}

/// Persistence failure. At steady state appends are infallible; this
/// surfaces only underlying I/O trouble.
#[derive(Debug)]
pub enum StoreError {
    Unavailable(sqlx::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Unavailable(e) => write!(f, "storage unavailable: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Unavailable(err)
    }
}
