// Error type for the sync crate.
//
// Most session operations are infallible from the caller's point of
// view (sends are best effort, host-only calls are silent no-ops), so
// `SyncError` only surfaces from configuration loading, URL construction, and
// the transport seam. The connection state machine converts transport errors
// into state transitions rather than returning them.

use thiserror::Error;

/// Errors raised while configuring or opening a relay connection.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The relay address or session parameters do not form a usable URL.
    #[error("invalid relay url: {0}")]
    InvalidUrl(String),

    /// The transport refused an operation (no socket, socket thread gone).
    #[error("transport error: {0}")]
    Transport(String),

    /// A configuration document could not be parsed.
    #[error("invalid config: {0}")]
    Config(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidUrl(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
