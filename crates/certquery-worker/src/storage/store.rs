//! Lookup capability the worker depends on.

use std::future::Future;

use super::db::{Database, DatabaseError};
use super::models::CertificateRecord;

/// Read-only point lookup over issued certificates.
pub trait CertificateStore: Send + Sync {
    fn lookup(
        &self,
        cpf: &str,
        nome: &str,
    ) -> impl Future<Output = Result<Option<CertificateRecord>, DatabaseError>> + Send;
}

impl CertificateStore for Database {
    async fn lookup(
        &self,
        cpf: &str,
        nome: &str,
    ) -> Result<Option<CertificateRecord>, DatabaseError> {
        self.lookup_certificate(cpf, nome).await
    }
}
