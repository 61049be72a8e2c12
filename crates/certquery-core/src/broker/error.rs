//! Broker connector error types.

/// Errors that end a connection attempt loop.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("Invalid broker endpoint: {0}")]
    InvalidUri(String),

    /// The broker kept refusing us at the protocol level (credentials,
    /// vhost permissions). Retrying will not help.
    #[error("Broker rejected connection after {attempts} attempts: {reason}")]
    Rejected { attempts: u32, reason: String },
}
