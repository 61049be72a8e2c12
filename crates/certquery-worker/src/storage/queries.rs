//! Database queries for the certificate store.

use super::db::{Database, DatabaseError, unix_timestamp};
use super::models::{CertificateParams, CertificateRecord};

impl Database {
    /// Exact point lookup on `(cpf, nome_completo)`.
    pub async fn lookup_certificate(
        &self,
        cpf: &str,
        nome: &str,
    ) -> Result<Option<CertificateRecord>, DatabaseError> {
        let record = sqlx::query_as::<_, CertificateRecord>(
            "SELECT * FROM certificates WHERE cpf = ? AND nome_completo = ?",
        )
        .bind(cpf)
        .bind(nome)
        .fetch_optional(self.pool())
        .await?;

        Ok(record)
    }

    /// Record an issued certificate.
    ///
    /// Re-issuing for the same `(cpf, nome_completo)` refreshes the
    /// completion date and score instead of creating a second record.
    pub async fn upsert_certificate(
        &self,
        params: CertificateParams<'_>,
    ) -> Result<CertificateRecord, DatabaseError> {
        let now = unix_timestamp();

        sqlx::query(
            r"
            INSERT INTO certificates (nome_completo, cpf, email, nota, data_conclusao, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (cpf, nome_completo) DO UPDATE SET
                data_conclusao = excluded.data_conclusao,
                nota = excluded.nota,
                email = excluded.email
            ",
        )
        .bind(params.nome_completo)
        .bind(params.cpf)
        .bind(params.email)
        .bind(params.nota)
        .bind(params.data_conclusao)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.lookup_certificate(params.cpf, params.nome_completo)
            .await?
            .ok_or_else(|| {
                DatabaseError::NotFound(format!("Certificate for {}", params.nome_completo))
            })
    }

    /// Number of stored certificates.
    pub async fn count_certificates(&self) -> Result<i64, DatabaseError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM certificates")
            .fetch_one(self.pool())
            .await?;
        Ok(count)
    }
}
