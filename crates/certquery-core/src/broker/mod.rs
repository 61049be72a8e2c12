//! Broker connectivity shared by the worker and the client.
//!
//! Produces live AMQP connections, masking broker unavailability with
//! unbounded, cancellable retries.

pub mod config;
pub mod connector;
pub mod error;
pub mod topology;

pub use config::ReconnectPolicy;
pub use connector::{BrokerConnector, ConnectFault, retry_connect};
pub use error::ConnectError;
pub use topology::{
    declare_reply_queue, declare_request_queue, reply_queue_options, request_queue_arguments,
};
