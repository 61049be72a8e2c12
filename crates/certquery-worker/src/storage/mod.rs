//! `SQLite` certificate store.
//!
//! Certificates are written by the training front end when a user generates
//! one; the worker performs point lookups only.

mod db;
mod models;
mod queries;
mod store;

pub use db::{Database, DatabaseError};
pub use models::*;
pub use store::CertificateStore;
