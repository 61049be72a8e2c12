//! `certquery` Client Library
//!
//! Requester side of the certificate lookup protocol:
//! - Request publishing with a per-request correlation id
//! - Reply dispatch from the shared reply queue
//! - CLI rendering of lookup results

pub mod client;
pub mod error;
pub mod lookup_cmd;
pub mod pending;

pub use client::CertificateClient;
pub use error::ClientError;
pub use pending::PendingReplies;
