//! Request/reply client for certificate lookups.

use std::time::Duration;

use chrono::Utc;
use lapin::options::{BasicConsumeOptions, BasicPublishOptions, ConfirmSelectOptions};
use lapin::types::{FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, Consumer};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use certquery_core::Config;
use certquery_core::broker::{
    BrokerConnector, ReconnectPolicy, declare_reply_queue, declare_request_queue,
};
use certquery_core::protocol::{self, CertificateQuery, CertificateQueryResult, JSON_CONTENT_TYPE};

use crate::error::ClientError;
use crate::pending::{PendingReplies, ReplyResult};

/// Consumer tag of the reply dispatcher.
pub const CONSUMER_TAG: &str = "certquery-client";

/// AMQP delivery mode of a message the broker writes to disk.
const PERSISTENT: u8 = 2;

/// Publishes certificate queries and matches replies by `correlation_id`.
pub struct CertificateClient {
    connection: Connection,
    channel: Channel,
    request_queue: String,
    reply_queue: String,
    request_timeout: Duration,
    pending: PendingReplies,
    shutdown: watch::Sender<bool>,
    dispatcher: JoinHandle<()>,
}

impl CertificateClient {
    /// Connect, declare the request queue and a private reply queue, and
    /// start dispatching replies.
    ///
    /// Waits for the broker like the worker does; wrap in a timeout for
    /// interactive use.
    pub async fn connect(config: &Config) -> Result<Self, ClientError> {
        let connector =
            BrokerConnector::new(&config.broker, ReconnectPolicy::from(&config.reconnect))?
                .with_connection_name("certquery-client");
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let connection = connector
            .connect(&mut shutdown_rx)
            .await?
            .ok_or(ClientError::Closed)?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| ClientError::Channel(format!("Failed to open channel: {e}")))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| ClientError::Channel(format!("Failed to enable confirms: {e}")))?;

        declare_request_queue(&channel, &config.queue)
            .await
            .map_err(|e| ClientError::Channel(format!("Failed to declare request queue: {e}")))?;
        let reply_queue = declare_reply_queue(&channel)
            .await
            .map_err(|e| ClientError::Channel(format!("Failed to declare reply queue: {e}")))?
            .name()
            .as_str()
            .to_string();
        info!(queue = %reply_queue, "Reply queue declared");

        let consumer = channel
            .basic_consume(
                &reply_queue,
                CONSUMER_TAG,
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| ClientError::Channel(format!("Failed to consume replies: {e}")))?;

        let pending = PendingReplies::new();
        let dispatcher = tokio::spawn(dispatch_replies(consumer, pending.clone(), shutdown_rx));

        Ok(Self {
            connection,
            channel,
            request_queue: config.queue.name.clone(),
            reply_queue,
            request_timeout: config.client.request_timeout(),
            pending,
            shutdown: shutdown_tx,
            dispatcher,
        })
    }

    /// Look up the certificate issued for `(cpf, nome)`.
    pub async fn query(&self, cpf: &str, nome: &str) -> Result<CertificateQueryResult, ClientError> {
        let query = CertificateQuery::new(cpf, nome);
        query
            .validate()
            .map_err(|e| ClientError::InvalidQuery(e.to_string()))?;
        if self.dispatcher.is_finished() {
            return Err(ClientError::Closed);
        }

        let correlation_id = Uuid::new_v4().to_string();
        let body = protocol::encode_query(&query, Utc::now().timestamp_millis())?;

        let rx = self.pending.register(correlation_id.clone()).await;
        let result = self.publish_and_wait(&correlation_id, &body, rx).await;
        self.pending.remove(&correlation_id).await;
        result
    }

    async fn publish_and_wait(
        &self,
        correlation_id: &str,
        body: &[u8],
        rx: oneshot::Receiver<ReplyResult>,
    ) -> Result<CertificateQueryResult, ClientError> {
        let confirm = self
            .channel
            .basic_publish(
                "",
                &self.request_queue,
                BasicPublishOptions::default(),
                body,
                request_properties(&self.reply_queue, correlation_id, self.request_timeout),
            )
            .await
            .map_err(|e| ClientError::Publish(e.to_string()))?
            .await
            .map_err(|e| ClientError::Publish(e.to_string()))?;
        if confirm.is_nack() {
            return Err(ClientError::Publish("Broker negatively confirmed the request".into()));
        }
        debug!(correlation_id, queue = %self.request_queue, "Certificate query published");

        match timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply?),
            Ok(Err(_)) => Err(ClientError::ResponseDropped(correlation_id.to_string())),
            Err(_) => {
                warn!(correlation_id, "Certificate query timed out");
                Err(ClientError::Timeout(self.request_timeout))
            }
        }
    }

    /// Number of requests still waiting for a reply.
    pub async fn in_flight(&self) -> usize {
        self.pending.len().await
    }

    /// Stop the dispatcher and close the connection.
    pub async fn close(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.dispatcher.await {
            debug!(error = %e, "Reply dispatcher ended abnormally");
        }
        if let Err(e) = self.channel.close(200, "Client closing").await {
            debug!(error = %e, "Channel close failed");
        }
        if let Err(e) = self.connection.close(200, "Client closing").await {
            debug!(error = %e, "Connection close failed");
        }
    }
}

/// Properties of a request message.
///
/// The expiration matches the reply timeout so the broker discards requests
/// nobody is waiting for anymore.
pub fn request_properties(
    reply_to: &str,
    correlation_id: &str,
    request_timeout: Duration,
) -> BasicProperties {
    BasicProperties::default()
        .with_content_type(ShortString::from(JSON_CONTENT_TYPE.to_string()))
        .with_delivery_mode(PERSISTENT)
        .with_reply_to(ShortString::from(reply_to.to_string()))
        .with_correlation_id(ShortString::from(correlation_id.to_string()))
        .with_expiration(ShortString::from(request_timeout.as_millis().to_string()))
}

/// Route replies from the reply queue to their waiters until shutdown or
/// until the consumer ends. Remaining waiters are then cancelled.
async fn dispatch_replies(
    mut consumer: Consumer,
    pending: PendingReplies,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let delivery = tokio::select! {
            next = consumer.next() => match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    warn!(error = %e, "Reply consumer failed");
                    break;
                }
                None => break,
            },
            _ = shutdown.changed() => break,
        };

        let Some(correlation_id) = delivery
            .properties
            .correlation_id()
            .as_ref()
            .map(ShortString::as_str)
        else {
            warn!("Dropping reply without correlation_id");
            continue;
        };

        let reply = protocol::decode_result(&delivery.data);
        if !pending.complete(correlation_id, reply).await {
            debug!(correlation_id, "Dropping reply for unknown or expired request");
        }
    }

    pending.cancel_all().await;
}
