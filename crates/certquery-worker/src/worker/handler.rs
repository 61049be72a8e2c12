//! Per-message business logic: decode, look up, build the reply.
//!
//! The handler never touches the broker. It returns what should be published
//! and how the request should be settled; [`super::delivery::settle`] carries
//! that out in the required order.

use tracing::{debug, error, info, warn};

use certquery_core::protocol::{self, CertificateQueryResult};

use crate::storage::CertificateStore;

/// Reply to publish on the default exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Queue named by the request's `reply_to`.
    pub routing_key: String,
    /// Echo of the request's `correlation_id`, if it had one.
    pub correlation_id: Option<String>,
    pub result: CertificateQueryResult,
    pub body: Vec<u8>,
}

/// Why a request is acknowledged without a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Body is not a JSON query.
    Malformed,
    /// Nowhere to send the answer.
    MissingReplyTo,
    /// Stored record cannot be rendered (completion date out of range).
    UnrenderableRecord,
}

/// How the request delivery is settled after the reply (if any) is published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Positive acknowledgment after the reply is confirmed.
    Ack,
    /// Acknowledge and discard; no reply is sent.
    Drop(DropReason),
    /// Negative acknowledgment with requeue; the request is retried later.
    Requeue,
}

/// Result of handling one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerOutcome {
    pub reply: Option<Reply>,
    pub disposition: Disposition,
}

impl HandlerOutcome {
    const fn dropped(reason: DropReason) -> Self {
        Self {
            reply: None,
            disposition: Disposition::Drop(reason),
        }
    }

    const fn requeue() -> Self {
        Self {
            reply: None,
            disposition: Disposition::Requeue,
        }
    }
}

/// Handle one certificate query.
pub async fn handle_query<S: CertificateStore>(
    store: &S,
    body: &[u8],
    reply_to: Option<&str>,
    correlation_id: Option<&str>,
) -> HandlerOutcome {
    let query = match protocol::decode_query(body) {
        Ok(query) => query,
        Err(e) => {
            warn!(error = %e, correlation_id, "Dropping malformed certificate query");
            return HandlerOutcome::dropped(DropReason::Malformed);
        }
    };

    let Some(reply_to) = reply_to.filter(|r| !r.is_empty()) else {
        warn!(
            cpf = %query.cpf,
            nome = %query.nome,
            correlation_id,
            "Dropping certificate query without reply_to"
        );
        return HandlerOutcome::dropped(DropReason::MissingReplyTo);
    };

    info!(
        cpf = %query.cpf,
        nome = %query.nome,
        correlation_id,
        "Certificate query received"
    );

    let result = match store.lookup(&query.cpf, &query.nome).await {
        Ok(Some(record)) => match record.to_details() {
            Ok(details) => CertificateQueryResult::Found(details),
            Err(e) => {
                error!(
                    error = %e,
                    certificate_id = record.id,
                    "Stored certificate cannot be rendered"
                );
                return HandlerOutcome::dropped(DropReason::UnrenderableRecord);
            }
        },
        Ok(None) => CertificateQueryResult::NotFound,
        Err(e) => {
            error!(error = %e, correlation_id, "Certificate lookup failed, requeueing");
            return HandlerOutcome::requeue();
        }
    };

    let body = match protocol::encode_result(&result) {
        Ok(body) => body,
        Err(e) => {
            error!(error = %e, correlation_id, "Failed to encode certificate reply");
            return HandlerOutcome::dropped(DropReason::UnrenderableRecord);
        }
    };

    debug!(
        reply_to,
        correlation_id,
        found = result.is_found(),
        "Certificate reply prepared"
    );

    HandlerOutcome {
        reply: Some(Reply {
            routing_key: reply_to.to_string(),
            correlation_id: correlation_id.map(ToString::to_string),
            result,
            body,
        }),
        disposition: Disposition::Ack,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::storage::{CertificateParams, CertificateRecord, Database, DatabaseError};

    struct BrokenStore;

    impl CertificateStore for BrokenStore {
        async fn lookup(
            &self,
            _cpf: &str,
            _nome: &str,
        ) -> Result<Option<CertificateRecord>, DatabaseError> {
            Err(DatabaseError::Connection("database is locked".into()))
        }
    }

    async fn seeded_db() -> Database {
        let db = Database::open_in_memory().await.unwrap();
        db.upsert_certificate(CertificateParams {
            nome_completo: "Ana Lima",
            cpf: "111.222.333-44",
            email: "ana@example.com",
            nota: 9,
            data_conclusao: 1_710_504_000,
        })
        .await
        .unwrap();
        db
    }

    #[tokio::test]
    async fn hit_replies_with_record_fields() {
        let db = seeded_db().await;
        let outcome = handle_query(
            &db,
            br#"{"cpf":"111.222.333-44","nome":"Ana Lima"}"#,
            Some("api_response_queue"),
            Some("corr-1"),
        )
        .await;

        assert_eq!(outcome.disposition, Disposition::Ack);
        let reply = outcome.reply.unwrap();
        assert_eq!(reply.routing_key, "api_response_queue");
        assert_eq!(reply.correlation_id.as_deref(), Some("corr-1"));
        let value: serde_json::Value = serde_json::from_slice(&reply.body).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "nome": "Ana Lima",
                "cpf": "111.222.333-44",
                "data_conclusao": "15/03/2024",
                "nota": 9,
            })
        );
    }

    #[tokio::test]
    async fn miss_replies_not_found() {
        let db = seeded_db().await;
        let outcome = handle_query(
            &db,
            br#"{"cpf":"111.222.333-44","nome":"Ana"}"#,
            Some("replies"),
            Some("corr-2"),
        )
        .await;

        assert_eq!(outcome.disposition, Disposition::Ack);
        let reply = outcome.reply.unwrap();
        assert_eq!(reply.result, CertificateQueryResult::NotFound);
        assert_eq!(
            String::from_utf8(reply.body).unwrap(),
            r#"{"error":"Certificado não encontrado"}"#
        );
    }

    #[tokio::test]
    async fn malformed_body_is_dropped_without_reply() {
        let db = seeded_db().await;
        let outcome = handle_query(&db, b"{\"cpf\":", Some("replies"), Some("c")).await;
        assert_eq!(outcome, HandlerOutcome::dropped(DropReason::Malformed));
    }

    #[tokio::test]
    async fn blank_fields_reply_not_found() {
        let db = seeded_db().await;
        for body in [
            br#"{"cpf":"","nome":"Ana Lima"}"#.as_slice(),
            br#"{"cpf":"111.222.333-44","nome":"  "}"#.as_slice(),
        ] {
            let outcome = handle_query(&db, body, Some("replies"), Some("c")).await;
            assert_eq!(outcome.disposition, Disposition::Ack);
            let reply = outcome.reply.unwrap();
            assert_eq!(reply.correlation_id.as_deref(), Some("c"));
            assert_eq!(reply.result, CertificateQueryResult::NotFound);
        }
    }

    #[tokio::test]
    async fn missing_reply_to_is_dropped() {
        let db = seeded_db().await;
        let body = br#"{"cpf":"111.222.333-44","nome":"Ana Lima"}"#;
        assert_eq!(
            handle_query(&db, body, None, Some("c")).await,
            HandlerOutcome::dropped(DropReason::MissingReplyTo)
        );
        assert_eq!(
            handle_query(&db, body, Some(""), Some("c")).await,
            HandlerOutcome::dropped(DropReason::MissingReplyTo)
        );
    }

    #[tokio::test]
    async fn missing_correlation_id_still_replies() {
        let db = seeded_db().await;
        let outcome = handle_query(
            &db,
            br#"{"cpf":"111.222.333-44","nome":"Ana Lima"}"#,
            Some("replies"),
            None,
        )
        .await;
        let reply = outcome.reply.unwrap();
        assert!(reply.correlation_id.is_none());
        assert!(reply.result.is_found());
    }

    #[tokio::test]
    async fn store_failure_requeues() {
        let outcome = handle_query(
            &BrokenStore,
            br#"{"cpf":"1","nome":"Ana"}"#,
            Some("replies"),
            Some("c"),
        )
        .await;
        assert_eq!(outcome, HandlerOutcome::requeue());
    }

    #[tokio::test]
    async fn unrenderable_record_is_dropped() {
        let db = Database::open_in_memory().await.unwrap();
        db.upsert_certificate(CertificateParams {
            nome_completo: "Ana Lima",
            cpf: "1",
            email: "",
            nota: 9,
            data_conclusao: i64::MAX,
        })
        .await
        .unwrap();

        let outcome =
            handle_query(&db, br#"{"cpf":"1","nome":"Ana Lima"}"#, Some("r"), Some("c")).await;
        assert_eq!(
            outcome,
            HandlerOutcome::dropped(DropReason::UnrenderableRecord)
        );
    }
}
