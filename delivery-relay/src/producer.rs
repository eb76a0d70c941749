//! Producer - accepts delivery status submissions and enqueues them.
//!
//! Each submission owns its queue resources: a client and a sender are
//! opened for the call and closed again before it returns, whatever the
//! outcome.

use std::sync::Arc;

use tracing::{debug, error, info};

use crate::config::QueueSettings;
use crate::error::SubmissionError;
use crate::queue::{
    decode_status, encode_update, DeliveryUpdate, OutboundMessage, QueueClient, QueueGateway,
    QueueSender,
};

/// Result of an accepted submission.
#[derive(Debug, Clone)]
pub struct Acknowledgement {
    /// The update as it was placed on the queue
    pub update: DeliveryUpdate,
    /// Messages actually carried by the send (0 if the update overflowed the batch)
    pub enqueued: usize,
}

/// Publishes delivery updates to the configured queue.
#[derive(Clone)]
pub struct Producer {
    gateway: Arc<dyn QueueGateway>,
    queue: QueueSettings,
}

impl Producer {
    pub fn new(gateway: Arc<dyn QueueGateway>, queue: QueueSettings) -> Self {
        Self { gateway, queue }
    }

    /// Validate, stamp and enqueue a raw request body.
    ///
    /// A malformed body is rejected before any queue resource is touched.
    /// Connect and send failures are logged and returned to the caller.
    /// The work runs on its own task, so dropping the returned future does
    /// not skip closing the sender and client.
    pub async fn handle_submission(&self, body: &[u8]) -> Result<Acknowledgement, SubmissionError> {
        let producer = self.clone();
        let body = body.to_vec();

        tokio::spawn(async move { producer.submit(&body).await }).await?
    }

    async fn submit(&self, body: &[u8]) -> Result<Acknowledgement, SubmissionError> {
        debug!(
            body_length = body.len(),
            body = %String::from_utf8_lossy(&body[..body.len().min(500)]),
            "delivery_update_received"
        );

        let status = match decode_status(body) {
            Ok(status) => status,
            Err(e) => {
                error!(error = %e, "delivery_update_malformed_body");
                return Err(e.into());
            }
        };

        let update = DeliveryUpdate::stamp(status);

        let mut client = match self.gateway.connect(&self.queue.connection_string).await {
            Ok(client) => client,
            Err(e) => {
                error!(error = %e, "delivery_update_connect_failed");
                return Err(SubmissionError::Connect(e));
            }
        };

        let result = self.publish(client.as_ref(), &update).await;
        client.close().await;
        let enqueued = result?;

        info!(
            queue = %self.queue.queue_name,
            status = %update.status,
            time = %update.time,
            enqueued = enqueued,
            "delivery_update_sent"
        );

        Ok(Acknowledgement { update, enqueued })
    }

    async fn publish(
        &self,
        client: &dyn QueueClient,
        update: &DeliveryUpdate,
    ) -> Result<usize, SubmissionError> {
        let mut sender = match client.open_sender(&self.queue.queue_name).await {
            Ok(sender) => sender,
            Err(e) => {
                error!(queue = %self.queue.queue_name, error = %e, "delivery_update_sender_failed");
                return Err(SubmissionError::Connect(e));
            }
        };

        let result = send_update(sender.as_ref(), update).await;
        sender.close().await;
        result
    }
}

/// Put one update in a fresh batch and send it.
///
/// An update too large for an empty batch is logged and the (empty) batch is
/// still sent.
async fn send_update(
    sender: &dyn QueueSender,
    update: &DeliveryUpdate,
) -> Result<usize, SubmissionError> {
    let body = encode_update(update).map_err(SubmissionError::Encode)?;
    let body_length = body.len();

    let mut batch = sender.create_batch();
    if let Err(e) = batch.try_add(OutboundMessage::new(body)) {
        error!(
            status = %update.status,
            body_length = body_length,
            error = %e,
            "delivery_update_batch_overflow"
        );
    }

    let enqueued = batch.len();
    if let Err(e) = sender.send(batch).await {
        error!(status = %update.status, error = %e, "delivery_update_send_failed");
        return Err(SubmissionError::Send(e));
    }

    Ok(enqueued)
}
