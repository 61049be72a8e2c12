//! Client error types.

use std::time::Duration;

use certquery_core::broker::ConnectError;
use certquery_core::protocol::ProtocolError;

/// Errors returned by [`crate::CertificateClient`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Failed to publish request: {0}")]
    Publish(String),

    #[error("No reply within {0:?}")]
    Timeout(Duration),

    #[error("Reply channel dropped: {0}")]
    ResponseDropped(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Client is closed")]
    Closed,
}
