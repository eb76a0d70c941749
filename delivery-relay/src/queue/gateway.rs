//! Queue gateway abstraction.
//!
//! A gateway hands out short-lived resources in a fixed hierarchy:
//!
//! ```text
//! QueueGateway::connect → QueueClient ─┬─ open_sender   → QueueSender
//!                                      └─ open_receiver → QueueReceiver
//! ```
//!
//! Every resource has an idempotent `close`. Callers own the pairing: each
//! successful `connect`/`open_*` is followed by exactly one `close` on every
//! exit path of the operation that acquired it.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::QueueError;

/// Entry point into a queue backend.
#[async_trait]
pub trait QueueGateway: Send + Sync {
    async fn connect(&self, connection_string: &str) -> Result<Box<dyn QueueClient>, QueueError>;
}

/// A live connection to the queue backend.
#[async_trait]
pub trait QueueClient: Send + Sync {
    async fn open_sender(&self, queue_name: &str) -> Result<Box<dyn QueueSender>, QueueError>;

    async fn open_receiver(
        &self,
        queue_name: &str,
        options: &ReceiverOptions,
    ) -> Result<Box<dyn QueueReceiver>, QueueError>;

    /// Release the connection. Safe to call more than once.
    async fn close(&mut self);
}

/// Publishes batches to a single queue.
#[async_trait]
pub trait QueueSender: Send + Sync {
    /// An empty batch sized for this queue.
    fn create_batch(&self) -> MessageBatch;

    async fn send(&self, batch: MessageBatch) -> Result<(), QueueError>;

    async fn close(&mut self);
}

/// Pushes messages from a single queue into a [`MessageHandler`].
#[async_trait]
pub trait QueueReceiver: Send + Sync {
    /// Begin delivering messages. Returns once delivery is running.
    async fn start(&mut self, handler: Arc<dyn MessageHandler>) -> Result<(), QueueError>;

    /// Stop delivering and wait for in-flight handler calls to settle.
    async fn stop(&mut self) -> Result<(), QueueError>;

    async fn close(&mut self);
}

/// Callbacks registered with a receiver.
///
/// Implementations may be called concurrently for distinct messages.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(&self, message: ReceivedMessage) -> Disposition;

    async fn handle_error(&self, error: QueueError);
}

/// What the receiver should do with a message once the handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Acknowledge; the message is removed from the queue.
    Complete,
    /// Leave unacknowledged; the queue redelivers it later.
    Abandon,
}

#[derive(Debug, Clone)]
pub struct ReceiverOptions {
    pub prefetch_count: u16,
}

impl Default for ReceiverOptions {
    fn default() -> Self {
        Self { prefetch_count: 16 }
    }
}

/// A message on its way into the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub message_id: String,
    pub body: Vec<u8>,
}

impl OutboundMessage {
    /// A JSON body tagged with a fresh message id.
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            body,
        }
    }
}

/// A message delivered by a receiver.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: Option<String>,
    /// `None` when the delivery carried no body at all
    pub body: Option<Vec<u8>>,
    pub redelivered: bool,
}

impl ReceivedMessage {
    pub fn body_text(&self) -> Option<String> {
        self.body
            .as_deref()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }
}

/// Messages destined for one `send` call.
///
/// A batch never grows past `max_size_bytes`; adding a message that would
/// overflow it is refused and leaves the batch unchanged.
#[derive(Debug)]
pub struct MessageBatch {
    max_size_bytes: usize,
    size_bytes: usize,
    messages: Vec<OutboundMessage>,
}

impl MessageBatch {
    pub fn new(max_size_bytes: usize) -> Self {
        Self {
            max_size_bytes,
            size_bytes: 0,
            messages: Vec::new(),
        }
    }

    pub fn try_add(&mut self, message: OutboundMessage) -> Result<(), QueueError> {
        let size = message.body.len();
        if self.size_bytes + size > self.max_size_bytes {
            return Err(QueueError::BatchOverflow {
                size,
                max: self.max_size_bytes - self.size_bytes,
            });
        }
        self.size_bytes += size;
        self.messages.push(message);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn into_messages(self) -> Vec<OutboundMessage> {
        self.messages
    }
}
