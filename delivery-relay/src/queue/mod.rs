//! Queue module.
//!
//! This module provides:
//! - The delivery update message schema
//! - The gateway traits the producer and consumer are written against
//! - A RabbitMQ gateway (lapin) and an in-process gateway
//!
//! ## Architecture
//!
//! ```text
//! Producer → QueueSender → delivery update queue → QueueReceiver → Consumer
//! ```

pub mod amqp;
pub mod gateway;
pub mod memory;
pub mod types;

use std::sync::Arc;

pub use amqp::AmqpGateway;
pub use gateway::{
    Disposition, MessageBatch, MessageHandler, OutboundMessage, QueueClient, QueueGateway,
    QueueReceiver, QueueSender, ReceivedMessage, ReceiverOptions,
};
pub use memory::{FaultPlan, GatewayStats, InMemoryGateway, StoredMessage, MEMORY_SCHEME};
pub use types::{decode_status, decode_update, encode_update, DeliveryStatus, DeliveryUpdate};

/// Pick a gateway from the scheme of the connection string.
pub fn gateway_for(connection_string: &str, max_message_bytes: usize) -> Arc<dyn QueueGateway> {
    if connection_string.starts_with(MEMORY_SCHEME) {
        Arc::new(InMemoryGateway::with_max_message_bytes(max_message_bytes))
    } else {
        Arc::new(AmqpGateway::new(max_message_bytes))
    }
}
