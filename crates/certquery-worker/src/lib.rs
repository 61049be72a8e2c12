//! `certquery` Worker Library
//!
//! Core functionality for the certificate query worker:
//! - `SQLite` certificate store
//! - Request/reply consumer over the `consulta_certificados` queue

pub mod storage;
pub mod worker;
