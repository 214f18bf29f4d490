//! Crate-level error type.
//!
//! Messages follow `"<operation> failed: <reason>"`, lowercase. Errors that
//! belong to the cluster collaborator live in [`crate::cluster::ClusterError`];
//! they are turned into symbolic result codes by the resource adapters and
//! never surface here.

use thiserror::Error;

use crate::config::ConfigError;

/// Result type alias using the crate's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while setting up or running the agent.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The server URL could not be turned into a WebSocket request.
    #[error("invalid server url: {0}")]
    InvalidUrl(String),

    /// The auth token is not a legal HTTP header value.
    #[error("invalid token header: {0}")]
    InvalidToken(#[from] tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue),

    /// WebSocket dial or handshake failed.
    #[error("connect failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("io failed: {0}")]
    Io(#[from] std::io::Error),
}
