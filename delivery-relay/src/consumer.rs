//! Consumer - drains the delivery update queue once per trigger.
//!
//! A drain connects, opens a receiver, lets it deliver messages for a fixed
//! window and then tears everything down:
//!
//! ```text
//! Idle → Connecting → Processing → DrainingTimeout → Disposing → Idle
//! ```
//!
//! Messages that arrive after the window closes stay on the queue for the
//! next trigger. Nothing inside a drain is reported back to the trigger as an
//! error; failures are logged and summarised in the returned [`DrainReport`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::{DrainOptions, QueueSettings};
use crate::error::QueueError;
use crate::queue::{
    decode_update, Disposition, MessageHandler, QueueClient, QueueGateway, QueueReceiver,
    ReceivedMessage, ReceiverOptions,
};

/// Cloud-event-shaped notification that asks for a drain.
///
/// Only used for logging; the payload is never processed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerEvent {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(rename = "type", default)]
    pub event_type: String,
    #[serde(default)]
    pub subject: String,
}

impl TriggerEvent {
    /// Read a trigger from a request body without ever refusing it.
    ///
    /// Accepts a single event or a batch (the first event is used). Anything
    /// else still triggers a drain, logged as an unnamed event.
    pub fn from_body(body: &[u8]) -> Self {
        if let Ok(event) = serde_json::from_slice::<TriggerEvent>(body) {
            return event;
        }
        if let Ok(mut batch) = serde_json::from_slice::<Vec<TriggerEvent>>(body) {
            if !batch.is_empty() {
                return batch.swap_remove(0);
            }
        }

        if !body.is_empty() {
            warn!(body_length = body.len(), "drain_trigger_unreadable");
        }
        TriggerEvent::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainState {
    Idle,
    Connecting,
    Processing,
    DrainingTimeout,
    Disposing,
}

impl DrainState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DrainState::Idle => "idle",
            DrainState::Connecting => "connecting",
            DrainState::Processing => "processing",
            DrainState::DrainingTimeout => "draining_timeout",
            DrainState::Disposing => "disposing",
        }
    }
}

fn enter(state: DrainState) {
    info!(state = state.as_str(), "drain_state_changed");
}

/// How a drain ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainOutcome {
    /// The window ran to completion
    Drained,
    /// No client could be created
    ConnectFailed,
    /// The client connected but no receiver could be opened
    ReceiverFailed,
    /// The receiver refused to start delivering
    StartFailed,
    /// The drain task panicked
    Aborted,
}

/// Summary of a single drain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub outcome: DrainOutcome,
    pub received: u64,
    pub completed: u64,
    pub abandoned: u64,
    pub poison: u64,
    pub transport_errors: u64,
}

/// Message and error handler registered with the receiver.
///
/// Holds nothing but counters, so concurrent calls for different messages
/// never contend.
#[derive(Debug, Default)]
pub struct DeliveryUpdateHandler {
    received: AtomicU64,
    completed: AtomicU64,
    abandoned: AtomicU64,
    poison: AtomicU64,
    transport_errors: AtomicU64,
}

impl DeliveryUpdateHandler {
    pub fn report(&self, outcome: DrainOutcome) -> DrainReport {
        DrainReport {
            outcome,
            received: self.received.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            abandoned: self.abandoned.load(Ordering::SeqCst),
            poison: self.poison.load(Ordering::SeqCst),
            transport_errors: self.transport_errors.load(Ordering::SeqCst),
        }
    }
}

#[async_trait]
impl MessageHandler for DeliveryUpdateHandler {
    async fn handle_message(&self, message: ReceivedMessage) -> Disposition {
        self.received.fetch_add(1, Ordering::SeqCst);
        let message_id = message.message_id.as_deref().unwrap_or("unknown");

        let Some(body) = message.body_text() else {
            error!(message_id = %message_id, "delivery_update_body_missing");
            self.abandoned.fetch_add(1, Ordering::SeqCst);
            return Disposition::Abandon;
        };

        match decode_update(body.as_bytes()) {
            Ok(update) => {
                info!(
                    message_id = %message_id,
                    status = %update.status,
                    time = %update.time,
                    redelivered = message.redelivered,
                    "delivery_update_received"
                );
            }
            Err(e) => {
                // Poison messages are completed too, so they are not redelivered forever.
                self.poison.fetch_add(1, Ordering::SeqCst);
                error!(
                    message_id = %message_id,
                    error = %e,
                    body_preview = %body.chars().take(500).collect::<String>(),
                    "delivery_update_poison_message"
                );
            }
        }

        self.completed.fetch_add(1, Ordering::SeqCst);
        Disposition::Complete
    }

    async fn handle_error(&self, error: QueueError) {
        self.transport_errors.fetch_add(1, Ordering::SeqCst);
        error!(error = %error, "delivery_update_receive_error");
    }
}

/// Drains the delivery update queue on demand.
#[derive(Clone)]
pub struct Consumer {
    gateway: Arc<dyn QueueGateway>,
    queue: QueueSettings,
    options: DrainOptions,
}

impl Consumer {
    pub fn new(gateway: Arc<dyn QueueGateway>, queue: QueueSettings, options: DrainOptions) -> Self {
        Self {
            gateway,
            queue,
            options,
        }
    }

    /// Run one bounded drain for a trigger event.
    ///
    /// The drain runs on its own task, so dropping the returned future (a
    /// disconnected HTTP caller) does not skip closing the receiver and client.
    pub async fn drain_on_trigger(&self, event: &TriggerEvent) -> DrainReport {
        let consumer = self.clone();
        let event = event.clone();

        match tokio::spawn(async move { consumer.drain(&event).await }).await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "drain_task_failed");
                DeliveryUpdateHandler::default().report(DrainOutcome::Aborted)
            }
        }
    }

    async fn drain(&self, event: &TriggerEvent) -> DrainReport {
        info!(
            event_type = %event.event_type,
            subject = %event.subject,
            event_id = ?event.id,
            "drain_triggered"
        );

        let handler = Arc::new(DeliveryUpdateHandler::default());

        enter(DrainState::Connecting);
        let mut client = match self.gateway.connect(&self.queue.connection_string).await {
            Ok(client) => client,
            Err(e) => {
                error!(error = %e, "drain_connect_failed");
                enter(DrainState::Idle);
                return handler.report(DrainOutcome::ConnectFailed);
            }
        };

        let outcome = self.process(client.as_ref(), Arc::clone(&handler)).await;

        client.close().await;
        info!("drain_receiver_and_client_disposed");
        enter(DrainState::Idle);

        let report = handler.report(outcome);
        info!(
            outcome = ?report.outcome,
            received = report.received,
            completed = report.completed,
            abandoned = report.abandoned,
            poison = report.poison,
            transport_errors = report.transport_errors,
            "drain_complete"
        );
        report
    }

    async fn process(
        &self,
        client: &dyn QueueClient,
        handler: Arc<DeliveryUpdateHandler>,
    ) -> DrainOutcome {
        let options = ReceiverOptions {
            prefetch_count: self.options.prefetch_count,
        };

        let mut receiver = match client.open_receiver(&self.queue.queue_name, &options).await {
            Ok(receiver) => receiver,
            Err(e) => {
                error!(queue = %self.queue.queue_name, error = %e, "drain_receiver_failed");
                enter(DrainState::Disposing);
                return DrainOutcome::ReceiverFailed;
            }
        };

        let outcome = self.run_window(receiver.as_mut(), handler).await;

        enter(DrainState::Disposing);
        receiver.close().await;
        outcome
    }

    async fn run_window(
        &self,
        receiver: &mut dyn QueueReceiver,
        handler: Arc<DeliveryUpdateHandler>,
    ) -> DrainOutcome {
        enter(DrainState::Processing);
        if let Err(e) = receiver.start(handler).await {
            error!(error = %e, "drain_start_failed");
            return DrainOutcome::StartFailed;
        }

        info!(
            queue = %self.queue.queue_name,
            window_ms = self.options.window.as_millis() as u64,
            "drain_window_open"
        );
        tokio::time::sleep(self.options.window).await;

        enter(DrainState::DrainingTimeout);
        if let Err(e) = receiver.stop().await {
            warn!(error = %e, "drain_stop_failed");
        }
        info!(queue = %self.queue.queue_name, "drain_window_closed");

        DrainOutcome::Drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    use crate::queue::{
        encode_update, DeliveryStatus, DeliveryUpdate, FaultPlan, GatewayStats, InMemoryGateway,
        MEMORY_SCHEME,
    };

    const QUEUE: &str = "delivery-updates";

    fn consumer(gateway: &InMemoryGateway, window: Duration) -> Consumer {
        Consumer::new(
            Arc::new(gateway.clone()),
            QueueSettings {
                connection_string: MEMORY_SCHEME.to_string(),
                queue_name: QUEUE.to_string(),
            },
            DrainOptions {
                window,
                prefetch_count: 16,
            },
        )
    }

    fn trigger() -> TriggerEvent {
        TriggerEvent {
            event_type: "Microsoft.Storage.BlobCreated".to_string(),
            subject: "/deliveries/batch-7".to_string(),
            ..Default::default()
        }
    }

    fn update_body(status: &str) -> Vec<u8> {
        encode_update(&DeliveryUpdate::stamp(DeliveryStatus {
            status: status.to_string(),
        }))
        .unwrap()
    }

    fn assert_balanced(stats: &GatewayStats) {
        assert_eq!(stats.connects, stats.client_closes);
        assert_eq!(stats.receivers_opened, stats.receiver_closes);
    }

    #[tokio::test]
    async fn test_poison_message_is_completed_with_the_rest() {
        let gateway = InMemoryGateway::new();
        gateway.enqueue(QUEUE, Some(update_body("delivered")));
        gateway.enqueue(QUEUE, Some(b"{not json".to_vec()));
        gateway.enqueue(QUEUE, Some(update_body("returned to sender")));

        let report = consumer(&gateway, Duration::from_millis(200))
            .drain_on_trigger(&trigger())
            .await;

        assert_eq!(report.outcome, DrainOutcome::Drained);
        assert_eq!(report.received, 3);
        assert_eq!(report.completed, 3);
        // One delivery_update_poison_message event per poison count.
        assert_eq!(report.poison, 1);
        assert_eq!(report.abandoned, 0);

        assert!(gateway.queued(QUEUE).is_empty());
        let stats = gateway.stats();
        assert_eq!(stats.completed, 3);
        assert_balanced(&stats);
    }

    #[tokio::test]
    async fn test_empty_queue_finishes_within_window() {
        let gateway = InMemoryGateway::new();
        let window = Duration::from_millis(100);
        let started = Instant::now();

        let report = consumer(&gateway, window).drain_on_trigger(&trigger()).await;

        let elapsed = started.elapsed();
        assert!(elapsed >= window);
        assert!(elapsed < window + Duration::from_secs(1));
        assert_eq!(report.outcome, DrainOutcome::Drained);
        assert_eq!(report.received, 0);
        assert_eq!(gateway.stats().completed, 0);
        assert_balanced(&gateway.stats());
    }

    #[tokio::test]
    async fn test_missing_body_is_left_for_redelivery() {
        let gateway = InMemoryGateway::new();
        gateway.enqueue(QUEUE, None);

        let report = consumer(&gateway, Duration::from_millis(100))
            .drain_on_trigger(&trigger())
            .await;

        assert_eq!(report.abandoned, 1);
        assert_eq!(report.completed, 0);

        let queued = gateway.queued(QUEUE);
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].delivery_count, 1);
    }

    #[tokio::test]
    async fn test_message_sent_during_window_is_processed() {
        let gateway = InMemoryGateway::new();
        let late = gateway.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            late.enqueue(QUEUE, Some(update_body("delivered")));
        });

        let report = consumer(&gateway, Duration::from_millis(300))
            .drain_on_trigger(&trigger())
            .await;

        assert_eq!(report.completed, 1);
        assert!(gateway.queued(QUEUE).is_empty());
    }

    #[tokio::test]
    async fn test_receive_errors_do_not_stop_the_drain() {
        let gateway = InMemoryGateway::new();
        gateway.inject(FaultPlan {
            receive_errors: 2,
            ..Default::default()
        });
        gateway.enqueue(QUEUE, Some(update_body("delivered")));

        let report = consumer(&gateway, Duration::from_millis(200))
            .drain_on_trigger(&trigger())
            .await;

        assert_eq!(report.outcome, DrainOutcome::Drained);
        assert_eq!(report.transport_errors, 2);
        assert_eq!(report.completed, 1);
        assert_balanced(&gateway.stats());
    }

    #[tokio::test]
    async fn test_connect_failure_opens_nothing() {
        let gateway = InMemoryGateway::new();
        gateway.inject(FaultPlan {
            fail_connect: true,
            ..Default::default()
        });
        gateway.enqueue(QUEUE, Some(update_body("delivered")));

        let report = consumer(&gateway, Duration::from_millis(50))
            .drain_on_trigger(&trigger())
            .await;

        assert_eq!(report.outcome, DrainOutcome::ConnectFailed);
        assert_eq!(gateway.stats().client_closes, 0);
        assert_eq!(gateway.queued(QUEUE).len(), 1);
    }

    #[tokio::test]
    async fn test_receiver_failure_closes_client() {
        let gateway = InMemoryGateway::new();
        gateway.inject(FaultPlan {
            fail_open_receiver: true,
            ..Default::default()
        });

        let report = consumer(&gateway, Duration::from_millis(50))
            .drain_on_trigger(&trigger())
            .await;

        assert_eq!(report.outcome, DrainOutcome::ReceiverFailed);
        let stats = gateway.stats();
        assert_eq!(stats.connects, 1);
        assert_eq!(stats.client_closes, 1);
        assert_eq!(stats.receiver_closes, 0);
    }

    #[tokio::test]
    async fn test_start_failure_closes_receiver_and_client() {
        let gateway = InMemoryGateway::new();
        gateway.inject(FaultPlan {
            fail_start: true,
            ..Default::default()
        });
        gateway.enqueue(QUEUE, Some(update_body("delivered")));

        let report = consumer(&gateway, Duration::from_millis(50))
            .drain_on_trigger(&trigger())
            .await;

        assert_eq!(report.outcome, DrainOutcome::StartFailed);
        let stats = gateway.stats();
        assert_eq!(stats.receivers_opened, 1);
        assert_eq!(stats.receiver_closes, 1);
        assert_eq!(stats.client_closes, 1);
        assert_eq!(gateway.queued(QUEUE).len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_drain_still_releases_resources() {
        let gateway = InMemoryGateway::new();
        gateway.enqueue(QUEUE, Some(update_body("delivered")));
        let consumer = consumer(&gateway, Duration::from_millis(200));

        let cancelled =
            tokio::time::timeout(Duration::from_millis(50), consumer.drain_on_trigger(&trigger()))
                .await;
        assert!(cancelled.is_err());

        tokio::time::sleep(Duration::from_millis(500)).await;

        let stats = gateway.stats();
        assert_eq!(stats.receivers_opened, 1);
        assert_eq!(stats.completed, 1);
        assert_balanced(&stats);
    }

    #[test]
    fn test_trigger_from_body_takes_first_of_batch() {
        let event = TriggerEvent::from_body(
            br#"[{"type": "delivery.drain", "subject": "first"}, {"type": "other"}]"#,
        );
        assert_eq!(event.event_type, "delivery.drain");
        assert_eq!(event.subject, "first");
    }

    #[test]
    fn test_trigger_from_unreadable_body_is_default() {
        assert_eq!(TriggerEvent::from_body(b"").event_type, "");
        assert_eq!(TriggerEvent::from_body(b"[]").subject, "");
        assert!(TriggerEvent::from_body(b"drain now").id.is_none());
    }

    #[test]
    fn test_trigger_event_from_cloud_event() {
        let event: TriggerEvent = serde_json::from_str(
            r#"{
                "specversion": "1.0",
                "id": "4c5b7a1e",
                "source": "/subscriptions/deliveries",
                "type": "Microsoft.EventGrid.CustomEvent",
                "subject": "deliveries/drain",
                "data": {"ignored": true}
            }"#,
        )
        .unwrap();

        assert_eq!(event.event_type, "Microsoft.EventGrid.CustomEvent");
        assert_eq!(event.subject, "deliveries/drain");
        assert_eq!(event.id.as_deref(), Some("4c5b7a1e"));
    }

    #[test]
    fn test_report_serializes_outcome_in_snake_case() {
        let report = DeliveryUpdateHandler::default().report(DrainOutcome::ConnectFailed);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["outcome"], "connect_failed");
        assert_eq!(json["received"], 0);
    }
}
