//! One broker session: a channel consuming the request queue.

use std::future::Future;
use std::time::Duration;

use lapin::message::Delivery;
use lapin::options::{BasicConsumeOptions, BasicQosOptions, ConfirmSelectOptions};
use lapin::types::{FieldTable, ShortString};
use lapin::{Channel, Connection, Consumer};
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use certquery_core::broker::{BrokerConnector, declare_request_queue};
use certquery_core::config::QueueConfig;

use super::delivery::{LapinDelivery, Settled, settle};
use super::error::WorkerError;
use super::handler::handle_query;
use crate::storage::CertificateStore;

/// Consumer tag announced to the broker.
pub const CONSUMER_TAG: &str = "certquery-worker";

/// Why a session stopped consuming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// Shutdown was requested; the connection can be closed cleanly.
    Shutdown,
    /// The channel or connection was lost; a new session is needed.
    Disconnected(String),
}

/// Source of broker sessions for the service's reconnect loop.
pub trait SessionFactory: Send + Sync {
    type Session: ActiveSession;

    /// Connect and start consuming.
    ///
    /// Resolves to `Ok(None)` when shutdown fires while waiting for the broker.
    fn open(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> impl Future<Output = Result<Option<Self::Session>, WorkerError>> + Send;
}

/// A consuming session as seen by the reconnect loop.
pub trait ActiveSession: Send {
    fn run<S: CertificateStore>(
        &mut self,
        store: &S,
        store_error_backoff: Duration,
        shutdown: &mut watch::Receiver<bool>,
    ) -> impl Future<Output = SessionEnd> + Send;

    /// Release the channel and connection.
    fn close(self) -> impl Future<Output = ()> + Send;
}

/// Opens [`Session`]s on connections from a [`BrokerConnector`].
pub struct BrokerSessions {
    connector: BrokerConnector,
    queue: QueueConfig,
}

impl BrokerSessions {
    pub const fn new(connector: BrokerConnector, queue: QueueConfig) -> Self {
        Self { connector, queue }
    }

    pub const fn connector(&self) -> &BrokerConnector {
        &self.connector
    }
}

impl SessionFactory for BrokerSessions {
    type Session = Session;

    async fn open(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<Session>, WorkerError> {
        let Some(connection) = self.connector.connect(shutdown).await? else {
            return Ok(None);
        };
        Session::open(connection, &self.queue).await.map(Some)
    }
}

/// A confirm-mode channel with an active consumer on the request queue.
pub struct Session {
    connection: Connection,
    channel: Channel,
    consumer: Consumer,
    queue: String,
}

impl Session {
    /// Open a channel on `connection`, declare the request queue and start
    /// consuming. The connection is closed if any step fails.
    pub async fn open(connection: Connection, queue: &QueueConfig) -> Result<Self, WorkerError> {
        match start_consuming(&connection, queue).await {
            Ok((channel, consumer)) => Ok(Self {
                connection,
                channel,
                consumer,
                queue: queue.name.clone(),
            }),
            Err(e) => {
                close_connection(&connection).await;
                Err(e)
            }
        }
    }

    /// Consume until shutdown or until the channel goes away.
    ///
    /// A delivery that has been received is always settled before shutdown
    /// is observed again.
    async fn consume<S: CertificateStore>(
        &mut self,
        store: &S,
        store_error_backoff: Duration,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        loop {
            if *shutdown.borrow() {
                return SessionEnd::Shutdown;
            }

            let delivery = tokio::select! {
                next = self.consumer.next() => match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(e)) => return SessionEnd::Disconnected(e.to_string()),
                    None => {
                        return SessionEnd::Disconnected(format!(
                            "Consumer on {} was cancelled",
                            self.queue
                        ));
                    }
                },
                _ = shutdown.changed() => return SessionEnd::Shutdown,
            };

            match self.process(store, &delivery).await {
                Ok(Settled::Requeued) => {
                    tokio::select! {
                        () = sleep(store_error_backoff) => {}
                        _ = shutdown.changed() => return SessionEnd::Shutdown,
                    }
                }
                Ok(Settled::Replied | Settled::Dropped) => {}
                Err(reason) => return SessionEnd::Disconnected(reason),
            }
        }
    }

    async fn process<S: CertificateStore>(
        &self,
        store: &S,
        delivery: &Delivery,
    ) -> Result<Settled, String> {
        let reply_to = delivery
            .properties
            .reply_to()
            .as_ref()
            .map(ShortString::as_str);
        let correlation_id = delivery
            .properties
            .correlation_id()
            .as_ref()
            .map(ShortString::as_str);

        debug!(
            delivery_tag = delivery.delivery_tag,
            redelivered = delivery.redelivered,
            correlation_id,
            "Delivery received"
        );

        let outcome = handle_query(store, &delivery.data, reply_to, correlation_id).await;
        let control = LapinDelivery::new(&self.channel, &delivery.acker);
        settle(&control, &outcome).await.map_err(|e| {
            warn!(error = %e, delivery_tag = delivery.delivery_tag, "Failed to settle delivery");
            e.to_string()
        })
    }

    /// Close the channel, then the connection if it is still up.
    async fn release(self) {
        if let Err(e) = self.channel.close(200, "Worker shutting down").await {
            debug!(error = %e, "Channel close failed");
        }
        close_connection(&self.connection).await;
    }
}

impl ActiveSession for Session {
    async fn run<S: CertificateStore>(
        &mut self,
        store: &S,
        store_error_backoff: Duration,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        self.consume(store, store_error_backoff, shutdown).await
    }

    async fn close(self) {
        self.release().await;
    }
}

async fn start_consuming(
    connection: &Connection,
    queue: &QueueConfig,
) -> Result<(Channel, Consumer), WorkerError> {
    let channel = connection
        .create_channel()
        .await
        .map_err(|e| WorkerError::Channel(format!("Failed to open channel: {e}")))?;

    channel
        .basic_qos(queue.prefetch, BasicQosOptions::default())
        .await
        .map_err(|e| WorkerError::Channel(format!("Failed to set QoS: {e}")))?;

    channel
        .confirm_select(ConfirmSelectOptions::default())
        .await
        .map_err(|e| WorkerError::Channel(format!("Failed to enable confirms: {e}")))?;

    declare_request_queue(&channel, queue)
        .await
        .map_err(|e| match e {
            lapin::Error::ProtocolError(_) => WorkerError::Declare {
                queue: queue.name.clone(),
                reason: e.to_string(),
            },
            other => WorkerError::Channel(format!("Failed to declare queue: {other}")),
        })?;

    let consumer = channel
        .basic_consume(
            &queue.name,
            CONSUMER_TAG,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| WorkerError::Channel(format!("Failed to start consumer: {e}")))?;

    info!(
        queue = %queue.name,
        prefetch = queue.prefetch,
        ttl_ms = queue.message_ttl_ms,
        "Waiting for certificate queries"
    );

    Ok((channel, consumer))
}

async fn close_connection(connection: &Connection) {
    if !connection.status().connected() {
        return;
    }
    if let Err(e) = connection.close(200, "Worker shutting down").await {
        debug!(error = %e, "Connection close failed");
    }
}
