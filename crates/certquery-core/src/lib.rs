//! `certquery` Core Library
//!
//! Shared functionality for `certquery` components:
//! - JSON wire protocol for certificate lookups over AMQP
//! - Broker connection, retry policy and queue declarations
//! - Configuration resolution and hierarchy
//! - Common error types

pub mod broker;
pub mod config;
pub mod error;
pub mod protocol;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
pub use protocol::{CertificateDetails, CertificateQuery, CertificateQueryResult};
