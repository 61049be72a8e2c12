//! Database models for the certificate store.

use serde::{Deserialize, Serialize};

use certquery_core::protocol::{CertificateDetails, ProtocolError};

/// Certificate record from the database, keyed by `(cpf, nome_completo)`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CertificateRecord {
    pub id: i64,
    pub nome_completo: String,
    pub cpf: String,
    pub email: String,
    pub nota: i64,
    /// Completion time, Unix seconds.
    pub data_conclusao: i64,
    pub created_at: i64,
}

impl CertificateRecord {
    /// Reply fields for this record.
    pub fn to_details(&self) -> Result<CertificateDetails, ProtocolError> {
        CertificateDetails::new(&self.nome_completo, &self.cpf, self.data_conclusao, self.nota)
    }
}

/// Parameters for recording an issued certificate.
#[derive(Debug, Clone, Copy)]
pub struct CertificateParams<'a> {
    pub nome_completo: &'a str,
    pub cpf: &'a str,
    pub email: &'a str,
    pub nota: i64,
    /// Completion time, Unix seconds.
    pub data_conclusao: i64,
}
