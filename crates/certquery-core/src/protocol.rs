//! JSON wire protocol for certificate lookups.
//!
//! Requests are published to the durable [`REQUEST_QUEUE`] with the AMQP
//! `reply_to` and `correlation_id` properties set by the requester. Replies
//! are published to the `reply_to` queue carrying the same `correlation_id`.
//! A reply body has exactly one of two shapes:
//!
//! ```json
//! { "nome": "...", "cpf": "...", "data_conclusao": "dd/mm/yyyy", "nota": 9 }
//! { "error": "Certificado não encontrado" }
//! ```

use serde::{Deserialize, Serialize};

/// Durable queue the worker consumes certificate queries from.
pub const REQUEST_QUEUE: &str = "consulta_certificados";

/// Per-message TTL declared on [`REQUEST_QUEUE`] (30 minutes).
pub const MESSAGE_TTL_MS: u32 = 1_800_000;

/// Queue argument carrying the per-message TTL.
pub const MESSAGE_TTL_ARGUMENT: &str = "x-message-ttl";

/// Error text of a lookup miss.
pub const NOT_FOUND_MESSAGE: &str = "Certificado não encontrado";

/// Content type set on every published message.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// `strftime` pattern of `data_conclusao`.
pub const COMPLETION_DATE_FORMAT: &str = "%d/%m/%Y";

/// Errors produced while decoding or encoding protocol messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed message body: {0}")]
    Malformed(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(&'static str),

    #[error("Unexpected error reply: {0}")]
    UnexpectedError(String),

    #[error("Completion timestamp out of range: {0}")]
    InvalidTimestamp(i64),

    #[error("Failed to encode message: {0}")]
    Encode(String),
}

/// Inbound lookup request: the `(cpf, nome)` key pair.
///
/// Extra fields sent by requesters (such as `timestamp`) are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateQuery {
    pub cpf: String,
    pub nome: String,
}

impl CertificateQuery {
    pub fn new(cpf: impl Into<String>, nome: impl Into<String>) -> Self {
        Self {
            cpf: cpf.into(),
            nome: nome.into(),
        }
    }

    /// Both fields are required and must not be blank.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.cpf.trim().is_empty() {
            return Err(ProtocolError::InvalidQuery("cpf is required"));
        }
        if self.nome.trim().is_empty() {
            return Err(ProtocolError::InvalidQuery("nome is required"));
        }
        Ok(())
    }
}

/// Request body as published by the client: the query plus a send timestamp.
#[derive(Serialize)]
struct QueryEnvelope<'a> {
    cpf: &'a str,
    nome: &'a str,
    timestamp: i64,
}

/// Certificate fields returned on a lookup hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateDetails {
    pub nome: String,
    pub cpf: String,
    /// Completion date formatted as `dd/mm/yyyy`.
    pub data_conclusao: String,
    pub nota: i64,
}

impl CertificateDetails {
    /// Build the reply fields from a stored record's values.
    pub fn new(
        nome: impl Into<String>,
        cpf: impl Into<String>,
        completed_at: i64,
        nota: i64,
    ) -> Result<Self, ProtocolError> {
        let data_conclusao = format_completion_date(completed_at)
            .ok_or(ProtocolError::InvalidTimestamp(completed_at))?;
        Ok(Self {
            nome: nome.into(),
            cpf: cpf.into(),
            data_conclusao,
            nota,
        })
    }
}

/// Outcome of a certificate lookup as carried in the reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "WireResult", try_from = "WireResult")]
pub enum CertificateQueryResult {
    Found(CertificateDetails),
    NotFound,
}

impl CertificateQueryResult {
    pub const fn is_found(&self) -> bool {
        matches!(self, Self::Found(_))
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum WireResult {
    Found(CertificateDetails),
    Error { error: String },
}

impl From<CertificateQueryResult> for WireResult {
    fn from(result: CertificateQueryResult) -> Self {
        match result {
            CertificateQueryResult::Found(details) => Self::Found(details),
            CertificateQueryResult::NotFound => Self::Error {
                error: NOT_FOUND_MESSAGE.to_string(),
            },
        }
    }
}

impl TryFrom<WireResult> for CertificateQueryResult {
    type Error = ProtocolError;

    fn try_from(wire: WireResult) -> Result<Self, Self::Error> {
        match wire {
            WireResult::Found(details) => Ok(Self::Found(details)),
            WireResult::Error { error } if error == NOT_FOUND_MESSAGE => Ok(Self::NotFound),
            WireResult::Error { error } => Err(ProtocolError::UnexpectedError(error)),
        }
    }
}

/// Render a Unix timestamp (seconds, UTC) as `dd/mm/yyyy`.
pub fn format_completion_date(unix_seconds: i64) -> Option<String> {
    chrono::DateTime::from_timestamp(unix_seconds, 0)
        .map(|dt| dt.format(COMPLETION_DATE_FORMAT).to_string())
}

/// Decode a request body. The body must be UTF-8 JSON with `cpf` and `nome`.
pub fn decode_query(body: &[u8]) -> Result<CertificateQuery, ProtocolError> {
    serde_json::from_slice(body).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Encode a request body, stamping it with the send time in milliseconds.
pub fn encode_query(query: &CertificateQuery, timestamp_ms: i64) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(&QueryEnvelope {
        cpf: &query.cpf,
        nome: &query.nome,
        timestamp: timestamp_ms,
    })
    .map_err(|e| ProtocolError::Encode(e.to_string()))
}

pub fn encode_result(result: &CertificateQueryResult) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(result).map_err(|e| ProtocolError::Encode(e.to_string()))
}

pub fn decode_result(body: &[u8]) -> Result<CertificateQueryResult, ProtocolError> {
    serde_json::from_slice(body).map_err(|e| match e.classify() {
        serde_json::error::Category::Data => {
            ProtocolError::UnexpectedError(e.to_string())
        }
        _ => ProtocolError::Malformed(e.to_string()),
    })
}
