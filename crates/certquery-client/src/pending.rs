//! Correlation registry for in-flight requests.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, oneshot};

use certquery_core::protocol::{CertificateQueryResult, ProtocolError};

/// Decoded reply, or why its body could not be decoded.
pub type ReplyResult = Result<CertificateQueryResult, ProtocolError>;

/// Reply waiters keyed by `correlation_id`.
#[derive(Clone, Default)]
pub struct PendingReplies {
    pending: Arc<RwLock<HashMap<String, oneshot::Sender<ReplyResult>>>>,
}

impl PendingReplies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending request and return a receiver for its reply.
    pub async fn register(&self, correlation_id: String) -> oneshot::Receiver<ReplyResult> {
        let (tx, rx) = oneshot::channel();
        self.pending.write().await.insert(correlation_id, tx);
        rx
    }

    /// Hand a reply to its waiter. Returns `false` if nobody is waiting.
    pub async fn complete(&self, correlation_id: &str, reply: ReplyResult) -> bool {
        if let Some(tx) = self.pending.write().await.remove(correlation_id) {
            tx.send(reply).is_ok()
        } else {
            false
        }
    }

    /// Forget a request, e.g. after it timed out.
    pub async fn remove(&self, correlation_id: &str) -> bool {
        self.pending.write().await.remove(correlation_id).is_some()
    }

    /// Drop every waiter; their receivers observe a closed channel.
    pub async fn cancel_all(&self) {
        self.pending.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.pending.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pending.read().await.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pending_request_lifecycle() {
        let pending = PendingReplies::new();
        let rx = pending.register("req-1".into()).await;
        assert_eq!(pending.len().await, 1);

        assert!(
            pending
                .complete("req-1", Ok(CertificateQueryResult::NotFound))
                .await
        );
        assert_eq!(rx.await.unwrap().unwrap(), CertificateQueryResult::NotFound);
        assert!(pending.is_empty().await);
    }

    #[tokio::test]
    async fn complete_unknown_returns_false() {
        let pending = PendingReplies::new();
        assert!(
            !pending
                .complete("nonexistent", Ok(CertificateQueryResult::NotFound))
                .await
        );
    }

    #[tokio::test]
    async fn complete_after_waiter_gave_up_returns_false() {
        let pending = PendingReplies::new();
        let rx = pending.register("req-1".into()).await;
        drop(rx);
        assert!(
            !pending
                .complete("req-1", Ok(CertificateQueryResult::NotFound))
                .await
        );
        assert!(pending.is_empty().await);
    }

    #[tokio::test]
    async fn removed_request_is_not_completed() {
        let pending = PendingReplies::new();
        let _rx = pending.register("req-1".into()).await;
        assert!(pending.remove("req-1").await);
        assert!(!pending.remove("req-1").await);
        assert!(
            !pending
                .complete("req-1", Ok(CertificateQueryResult::NotFound))
                .await
        );
    }

    #[tokio::test]
    async fn cancel_all_closes_receivers() {
        let pending = PendingReplies::new();
        let rx1 = pending.register("a".into()).await;
        let rx2 = pending.register("b".into()).await;

        pending.cancel_all().await;

        assert!(rx1.await.is_err());
        assert!(rx2.await.is_err());
        assert!(pending.is_empty().await);
    }

    #[tokio::test]
    async fn decode_failures_reach_the_waiter() {
        let pending = PendingReplies::new();
        let rx = pending.register("req-1".into()).await;
        pending
            .complete("req-1", Err(ProtocolError::Malformed("eof".into())))
            .await;
        assert!(matches!(
            rx.await.unwrap(),
            Err(ProtocolError::Malformed(_))
        ));
    }
}
