//! Settling a request delivery: publish the reply, then ack or nack.

use std::future::Future;

use lapin::acker::Acker;
use lapin::options::{BasicAckOptions, BasicNackOptions, BasicPublishOptions};
use lapin::types::ShortString;
use lapin::{BasicProperties, Channel};
use tracing::{debug, warn};

use certquery_core::protocol::JSON_CONTENT_TYPE;

use super::error::PublishError;
use super::handler::{Disposition, HandlerOutcome, Reply};

/// Broker operations needed to settle one delivery.
pub trait DeliveryControl: Send + Sync {
    /// Publish the reply and wait for the broker's confirm.
    fn publish_reply(&self, reply: &Reply) -> impl Future<Output = Result<(), PublishError>> + Send;

    fn ack(&self) -> impl Future<Output = Result<(), lapin::Error>> + Send;

    fn requeue(&self) -> impl Future<Output = Result<(), lapin::Error>> + Send;
}

/// How a delivery ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settled {
    Replied,
    Dropped,
    Requeued,
}

/// Why settling failed. Either way the session is no longer trustworthy.
#[derive(Debug, thiserror::Error)]
pub enum SettleError {
    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error("Failed to settle delivery: {0}")]
    Ack(#[from] lapin::Error),
}

/// Carry out a handler outcome.
///
/// The request is acknowledged only after its reply is confirmed. If the
/// reply cannot be published the request is requeued (best effort; a dead
/// channel requeues it anyway) so it is redelivered.
pub async fn settle<D: DeliveryControl>(
    control: &D,
    outcome: &HandlerOutcome,
) -> Result<Settled, SettleError> {
    if let Some(reply) = &outcome.reply {
        if let Err(e) = control.publish_reply(reply).await {
            warn!(
                error = %e,
                reply_to = %reply.routing_key,
                correlation_id = reply.correlation_id.as_deref(),
                "Reply not published, requeueing request"
            );
            if let Err(nack_err) = control.requeue().await {
                debug!(error = %nack_err, "Requeue after failed publish also failed");
            }
            return Err(e.into());
        }
    }

    match outcome.disposition {
        Disposition::Ack => {
            control.ack().await?;
            Ok(Settled::Replied)
        }
        Disposition::Drop(_) => {
            control.ack().await?;
            Ok(Settled::Dropped)
        }
        Disposition::Requeue => {
            control.requeue().await?;
            Ok(Settled::Requeued)
        }
    }
}

/// [`DeliveryControl`] over a live lapin channel.
pub struct LapinDelivery<'a> {
    channel: &'a Channel,
    acker: &'a Acker,
}

impl<'a> LapinDelivery<'a> {
    pub const fn new(channel: &'a Channel, acker: &'a Acker) -> Self {
        Self { channel, acker }
    }
}

/// Properties of a reply message.
pub fn reply_properties(correlation_id: Option<&str>) -> BasicProperties {
    let properties = BasicProperties::default()
        .with_content_type(ShortString::from(JSON_CONTENT_TYPE.to_string()));
    match correlation_id {
        Some(id) => properties.with_correlation_id(ShortString::from(id.to_string())),
        None => properties,
    }
}

impl DeliveryControl for LapinDelivery<'_> {
    async fn publish_reply(&self, reply: &Reply) -> Result<(), PublishError> {
        let confirm = self
            .channel
            .basic_publish(
                "",
                &reply.routing_key,
                BasicPublishOptions::default(),
                &reply.body,
                reply_properties(reply.correlation_id.as_deref()),
            )
            .await
            .map_err(|e| PublishError::Broker(e.to_string()))?
            .await
            .map_err(|e| PublishError::Broker(e.to_string()))?;

        if confirm.is_nack() {
            return Err(PublishError::Nacked);
        }
        debug!(
            reply_to = %reply.routing_key,
            correlation_id = reply.correlation_id.as_deref(),
            "Reply published"
        );
        Ok(())
    }

    async fn ack(&self) -> Result<(), lapin::Error> {
        self.acker.ack(BasicAckOptions::default()).await
    }

    async fn requeue(&self) -> Result<(), lapin::Error> {
        self.acker
            .nack(BasicNackOptions {
                requeue: true,
                ..BasicNackOptions::default()
            })
            .await
    }
}
