//! Client error types.

use thiserror::Error;

use crate::config::ConfigError;

/// Errors surfaced by API operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Transport failure or server-reported error, reduced to one message.
    ///
    /// When the backend attaches a structured error payload, the message is
    /// the payload's `error` field; otherwise it is the transport failure
    /// itself. Raw HTTP client errors never cross this boundary.
    #[error("{0}")]
    Request(String),

    /// A parameter failed validation; nothing was sent to the backend.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Persisting the connection configuration failed.
    #[error(transparent)]
    Config(#[from] ConfigError),
}
