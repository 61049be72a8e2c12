//! Queue declarations shared by the worker and the client.
//!
//! Both sides declare the request queue with identical arguments so that
//! whichever starts first creates it and the other attaches to it. Reply
//! queues are private to one client connection.

use lapin::options::QueueDeclareOptions;
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{Channel, Queue};

use crate::config::QueueConfig;
use crate::protocol::MESSAGE_TTL_ARGUMENT;

/// Arguments of the request queue: the per-message TTL.
pub fn request_queue_arguments(message_ttl_ms: u32) -> FieldTable {
    let ttl = i32::try_from(message_ttl_ms).map_or_else(
        |_| AMQPValue::LongLongInt(i64::from(message_ttl_ms)),
        AMQPValue::LongInt,
    );
    let mut arguments = FieldTable::default();
    arguments.insert(ShortString::from(MESSAGE_TTL_ARGUMENT.to_string()), ttl);
    arguments
}

/// Declare (or attach to) the durable, TTL-bounded request queue.
pub async fn declare_request_queue(
    channel: &Channel,
    queue: &QueueConfig,
) -> Result<Queue, lapin::Error> {
    channel
        .queue_declare(
            &queue.name,
            QueueDeclareOptions {
                durable: true,
                ..QueueDeclareOptions::default()
            },
            request_queue_arguments(queue.message_ttl_ms),
        )
        .await
}

/// Options of a client's reply queue: broker-named, private to the
/// declaring connection and deleted with it.
pub fn reply_queue_options() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: false,
        exclusive: true,
        auto_delete: true,
        ..QueueDeclareOptions::default()
    }
}

/// Declare a fresh reply queue. Its name is chosen by the broker and is
/// available from the returned [`Queue`].
pub async fn declare_reply_queue(channel: &Channel) -> Result<Queue, lapin::Error> {
    channel
        .queue_declare("", reply_queue_options(), FieldTable::default())
        .await
}
