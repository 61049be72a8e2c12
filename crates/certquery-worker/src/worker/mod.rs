//! Certificate query worker.
//!
//! Consumes lookup requests from the durable request queue, answers each on
//! its `reply_to` queue with the request's `correlation_id`, and acknowledges
//! the request only once the reply has been confirmed by the broker.

pub mod delivery;
pub mod error;
pub mod handler;
pub mod service;
pub mod session;

pub use delivery::{DeliveryControl, LapinDelivery, SettleError, Settled, settle};
pub use error::{PublishError, WorkerError};
pub use handler::{Disposition, DropReason, HandlerOutcome, Reply, handle_query};
pub use service::{CertificateQueryService, ServiceHandle, run_sessions};
pub use session::{ActiveSession, BrokerSessions, Session, SessionEnd, SessionFactory};
