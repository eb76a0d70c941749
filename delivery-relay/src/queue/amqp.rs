//! RabbitMQ queue gateway using lapin.
//!
//! Unlike a long-lived publisher, every resource here is created for one
//! invocation and torn down by its owner: the client owns the connection,
//! and senders and receivers each own one channel.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer,
};
use tokio::{sync::oneshot, task::JoinHandle, task::JoinSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::gateway::{
    Disposition, MessageBatch, MessageHandler, QueueClient, QueueGateway, QueueReceiver,
    QueueSender, ReceivedMessage, ReceiverOptions,
};
use crate::error::QueueError;

/// Gateway that connects to RabbitMQ over AMQP 0-9-1.
#[derive(Debug, Clone)]
pub struct AmqpGateway {
    max_message_bytes: usize,
}

impl AmqpGateway {
    pub fn new(max_message_bytes: usize) -> Self {
        Self { max_message_bytes }
    }
}

#[async_trait]
impl QueueGateway for AmqpGateway {
    async fn connect(&self, connection_string: &str) -> Result<Box<dyn QueueClient>, QueueError> {
        if connection_string.is_empty() {
            return Err(QueueError::Connect("connection string is empty".to_string()));
        }

        info!(url_length = connection_string.len(), "rabbitmq_connecting");

        let connection = Connection::connect(connection_string, ConnectionProperties::default())
            .await
            .map_err(|e| QueueError::Connect(e.to_string()))?;

        info!("rabbitmq_connected");

        Ok(Box::new(AmqpClient {
            connection: Some(connection),
            max_message_bytes: self.max_message_bytes,
        }))
    }
}

struct AmqpClient {
    connection: Option<Connection>,
    max_message_bytes: usize,
}

impl AmqpClient {
    /// Create a channel with the queue declared, closing it again on failure.
    async fn open_channel(&self, queue_name: &str) -> Result<Channel, QueueError> {
        if queue_name.is_empty() {
            return Err(QueueError::Connect("queue name is empty".to_string()));
        }

        let connection = self.connection.as_ref().ok_or(QueueError::Closed("client"))?;
        let channel = connection.create_channel().await?;

        let declared = channel
            .queue_declare(
                queue_name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await;

        if let Err(e) = declared {
            close_channel(&channel).await;
            return Err(e.into());
        }

        info!(queue = queue_name, "rabbitmq_queue_declared");
        Ok(channel)
    }
}

#[async_trait]
impl QueueClient for AmqpClient {
    async fn open_sender(&self, queue_name: &str) -> Result<Box<dyn QueueSender>, QueueError> {
        let channel = self.open_channel(queue_name).await?;

        if let Err(e) = channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
        {
            close_channel(&channel).await;
            return Err(e.into());
        }

        Ok(Box::new(AmqpSender {
            channel: Some(channel),
            queue_name: queue_name.to_string(),
            max_message_bytes: self.max_message_bytes,
        }))
    }

    async fn open_receiver(
        &self,
        queue_name: &str,
        options: &ReceiverOptions,
    ) -> Result<Box<dyn QueueReceiver>, QueueError> {
        let channel = self.open_channel(queue_name).await?;

        if let Err(e) = channel
            .basic_qos(options.prefetch_count, BasicQosOptions::default())
            .await
        {
            close_channel(&channel).await;
            return Err(e.into());
        }

        debug!(prefetch_count = options.prefetch_count, "rabbitmq_qos_set");

        Ok(Box::new(AmqpReceiver {
            channel: Some(channel),
            queue_name: queue_name.to_string(),
            running: None,
        }))
    }

    async fn close(&mut self) {
        if let Some(connection) = self.connection.take() {
            if let Err(e) = connection.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_connection_close_error");
            }
            info!("rabbitmq_connection_closed");
        }
    }
}

struct AmqpSender {
    channel: Option<Channel>,
    queue_name: String,
    max_message_bytes: usize,
}

#[async_trait]
impl QueueSender for AmqpSender {
    fn create_batch(&self) -> MessageBatch {
        MessageBatch::new(self.max_message_bytes)
    }

    async fn send(&self, batch: MessageBatch) -> Result<(), QueueError> {
        let channel = self.channel.as_ref().ok_or(QueueError::Closed("sender"))?;

        for message in batch.into_messages() {
            let confirmation = channel
                .basic_publish(
                    "",
                    &self.queue_name,
                    BasicPublishOptions::default(),
                    &message.body,
                    BasicProperties::default()
                        .with_delivery_mode(2) // Persistent
                        .with_content_type("application/json".into())
                        .with_message_id(message.message_id.clone().into()),
                )
                .await?
                .await?;

            if confirmation.is_nack() {
                return Err(QueueError::Transport(format!(
                    "broker rejected message {}",
                    message.message_id
                )));
            }

            debug!(
                queue = %self.queue_name,
                message_id = %message.message_id,
                body_length = message.body.len(),
                "rabbitmq_message_published"
            );
        }

        Ok(())
    }

    async fn close(&mut self) {
        if let Some(channel) = self.channel.take() {
            close_channel(&channel).await;
        }
    }
}

struct RunningConsumer {
    consumer_tag: String,
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

struct AmqpReceiver {
    channel: Option<Channel>,
    queue_name: String,
    running: Option<RunningConsumer>,
}

#[async_trait]
impl QueueReceiver for AmqpReceiver {
    async fn start(&mut self, handler: Arc<dyn MessageHandler>) -> Result<(), QueueError> {
        let channel = self.channel.as_ref().ok_or(QueueError::Closed("receiver"))?;
        if self.running.is_some() {
            return Ok(());
        }

        let consumer_tag = format!("delivery-drain-{}", Uuid::new_v4());
        let consumer = channel
            .basic_consume(
                &self.queue_name,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        info!(queue = %self.queue_name, consumer_tag = %consumer_tag, "rabbitmq_consumer_started");

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(pump(consumer, channel.clone(), handler, stop_rx));

        self.running = Some(RunningConsumer {
            consumer_tag,
            stop_tx,
            task,
        });
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), QueueError> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };

        let _ = running.stop_tx.send(());
        if let Err(e) = running.task.await {
            warn!(error = %e, "rabbitmq_consumer_task_failed");
        }

        if let Some(channel) = self.channel.as_ref() {
            channel
                .basic_cancel(&running.consumer_tag, BasicCancelOptions::default())
                .await?;
        }

        info!(queue = %self.queue_name, "rabbitmq_consumer_stopped");
        Ok(())
    }

    async fn close(&mut self) {
        if let Err(e) = self.stop().await {
            warn!(error = %e, "rabbitmq_consumer_cancel_error");
        }

        // Unacknowledged deliveries go back to the queue when the channel closes.
        if let Some(channel) = self.channel.take() {
            close_channel(&channel).await;
        }
    }
}

/// Feed deliveries to the handler until stopped, then wait for in-flight calls.
async fn pump(
    mut consumer: Consumer,
    channel: Channel,
    handler: Arc<dyn MessageHandler>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            delivery = consumer.next() => {
                match delivery {
                    Some(Ok(delivery)) => {
                        let channel = channel.clone();
                        let handler = Arc::clone(&handler);
                        in_flight.spawn(async move {
                            settle(&channel, delivery, handler.as_ref()).await;
                        });
                    }
                    Some(Err(e)) => handler.handle_error(e.into()).await,
                    None => {
                        warn!("rabbitmq_consumer_closed");
                        break;
                    }
                }
            }
            Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
        }
    }

    while in_flight.join_next().await.is_some() {}
}

async fn settle(channel: &Channel, delivery: Delivery, handler: &dyn MessageHandler) {
    let delivery_tag = delivery.delivery_tag;
    let message = ReceivedMessage {
        message_id: delivery
            .properties
            .message_id()
            .as_ref()
            .map(|s| s.to_string()),
        redelivered: delivery.redelivered,
        body: if delivery.data.is_empty() {
            None
        } else {
            Some(delivery.data)
        },
    };

    match handler.handle_message(message).await {
        Disposition::Complete => {
            if let Err(e) = channel
                .basic_ack(delivery_tag, BasicAckOptions::default())
                .await
            {
                handler.handle_error(e.into()).await;
            }
        }
        Disposition::Abandon => {
            debug!(delivery_tag = delivery_tag, "rabbitmq_delivery_left_unacked");
        }
    }
}

async fn close_channel(channel: &Channel) {
    if let Err(e) = channel.close(200, "Normal shutdown").await {
        warn!(error = %e, "rabbitmq_channel_close_error");
    }
}
