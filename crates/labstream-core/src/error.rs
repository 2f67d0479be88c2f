use std::io;
use thiserror::Error;

/// Errors surfaced by streams, inlets and the resolver.
///
/// Absence of data is not an error: an empty resolve result and an
/// expired pull deadline are reported through ordinary return values.
#[derive(Debug, Error)]
pub enum Error {
    /// A deadline elapsed before the operation could complete.
    #[error("the operation timed out")]
    Timeout,

    /// The peer outlet vanished or ended the stream.
    #[error("the stream has been lost")]
    LostConnection,

    /// The handle was closed locally.
    #[error("the handle has been closed")]
    Closed,

    /// A caller-provided value violates the stream's schema.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The peer sent something that cannot be interpreted.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Unexpected failure of the underlying network transport.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// The configuration handed to a constructor is inconsistent.
    #[error("configuration error: {0}")]
    Config(eyre::Report),
}

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
