//! Worker error types.

use certquery_core::broker::ConnectError;

/// Errors that stop the worker or end a broker session.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// Channel setup or consume failed; the session is re-established.
    #[error("Channel error: {0}")]
    Channel(String),

    /// The broker refused the queue declaration (e.g. an existing queue with
    /// conflicting arguments). Not retried.
    #[error("Failed to declare queue {queue}: {reason}")]
    Declare { queue: String, reason: String },

    #[error("Worker task failed: {0}")]
    Task(String),
}

impl WorkerError {
    /// Whether the worker should stop instead of reconnecting.
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::Channel(_))
    }
}

/// Failure to get a reply accepted by the broker.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Publish failed: {0}")]
    Broker(String),

    #[error("Broker negatively confirmed the reply")]
    Nacked,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_channel_errors_are_recoverable() {
        assert!(!WorkerError::Channel("closed".into()).is_fatal());
        assert!(
            WorkerError::Declare {
                queue: "q".into(),
                reason: "PRECONDITION_FAILED".into(),
            }
            .is_fatal()
        );
        assert!(WorkerError::Task("panicked".into()).is_fatal());
    }
}
