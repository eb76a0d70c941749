//! In-process queue gateway.
//!
//! Behaves like the AMQP gateway from the caller's point of view, but keeps
//! messages in memory and records every resource acquisition and release.
//! Faults can be injected at each step to exercise the error paths of the
//! producer and consumer. Selected with a `memory://` connection string.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use super::gateway::{
    Disposition, MessageBatch, MessageHandler, QueueClient, QueueGateway, QueueReceiver,
    QueueSender, ReceivedMessage, ReceiverOptions,
};
use crate::config::DEFAULT_MAX_MESSAGE_BYTES;
use crate::error::QueueError;

/// Connection string prefix that selects the in-memory backend.
pub const MEMORY_SCHEME: &str = "memory://";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Failures to inject into the next operations.
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    pub fail_connect: bool,
    pub fail_open_sender: bool,
    pub fail_open_receiver: bool,
    pub fail_send: bool,
    pub fail_start: bool,
    /// Transport errors reported to the error handler when a receiver starts
    pub receive_errors: usize,
    /// Hold every send this long before it lands on the queue
    pub send_delay: Option<Duration>,
}

/// A message sitting in an in-memory queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub message_id: Option<String>,
    pub body: Option<Vec<u8>>,
    pub delivery_count: u32,
}

/// Call counts since the gateway was created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewayStats {
    pub connects: u64,
    pub client_closes: u64,
    pub senders_opened: u64,
    pub sender_closes: u64,
    pub receivers_opened: u64,
    pub receiver_closes: u64,
    pub send_calls: u64,
    pub messages_sent: u64,
    pub completed: u64,
    pub abandoned: u64,
}

#[derive(Default)]
struct Counters {
    connects: AtomicU64,
    client_closes: AtomicU64,
    senders_opened: AtomicU64,
    sender_closes: AtomicU64,
    receivers_opened: AtomicU64,
    receiver_closes: AtomicU64,
    send_calls: AtomicU64,
    messages_sent: AtomicU64,
    completed: AtomicU64,
    abandoned: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::SeqCst);
}

#[derive(Default)]
struct MemoryQueue {
    messages: Mutex<VecDeque<StoredMessage>>,
    arrived: Notify,
}

impl MemoryQueue {
    fn push_back(&self, message: StoredMessage) {
        lock(&self.messages).push_back(message);
        self.arrived.notify_one();
    }

    fn push_front(&self, message: StoredMessage) {
        lock(&self.messages).push_front(message);
        self.arrived.notify_one();
    }

    fn pop(&self) -> Option<StoredMessage> {
        lock(&self.messages).pop_front()
    }

    /// Wait for the next message; cancel-safe.
    async fn next(&self) -> StoredMessage {
        loop {
            let arrived = self.arrived.notified();
            if let Some(message) = self.pop() {
                return message;
            }
            arrived.await;
        }
    }
}

struct Inner {
    max_message_bytes: usize,
    queues: Mutex<HashMap<String, Arc<MemoryQueue>>>,
    faults: Mutex<FaultPlan>,
    counters: Counters,
}

impl Inner {
    fn queue(&self, name: &str) -> Arc<MemoryQueue> {
        Arc::clone(lock(&self.queues).entry(name.to_string()).or_default())
    }

    fn faults(&self) -> FaultPlan {
        lock(&self.faults).clone()
    }
}

/// Gateway backed by in-process queues.
#[derive(Clone)]
pub struct InMemoryGateway {
    inner: Arc<Inner>,
}

impl Default for InMemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::with_max_message_bytes(DEFAULT_MAX_MESSAGE_BYTES)
    }

    pub fn with_max_message_bytes(max_message_bytes: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                max_message_bytes,
                queues: Mutex::new(HashMap::new()),
                faults: Mutex::new(FaultPlan::default()),
                counters: Counters::default(),
            }),
        }
    }

    /// Replace the active fault plan.
    pub fn inject(&self, plan: FaultPlan) {
        *lock(&self.inner.faults) = plan;
    }

    /// Put a raw body on a queue, as another producer would.
    pub fn enqueue(&self, queue_name: &str, body: Option<Vec<u8>>) {
        self.inner.queue(queue_name).push_back(StoredMessage {
            message_id: None,
            body,
            delivery_count: 0,
        });
    }

    /// Snapshot of the messages currently waiting on a queue.
    pub fn queued(&self, queue_name: &str) -> Vec<StoredMessage> {
        let queue = self.inner.queue(queue_name);
        let messages = lock(&queue.messages);
        messages.iter().cloned().collect()
    }

    pub fn stats(&self) -> GatewayStats {
        let c = &self.inner.counters;
        GatewayStats {
            connects: c.connects.load(Ordering::SeqCst),
            client_closes: c.client_closes.load(Ordering::SeqCst),
            senders_opened: c.senders_opened.load(Ordering::SeqCst),
            sender_closes: c.sender_closes.load(Ordering::SeqCst),
            receivers_opened: c.receivers_opened.load(Ordering::SeqCst),
            receiver_closes: c.receiver_closes.load(Ordering::SeqCst),
            send_calls: c.send_calls.load(Ordering::SeqCst),
            messages_sent: c.messages_sent.load(Ordering::SeqCst),
            completed: c.completed.load(Ordering::SeqCst),
            abandoned: c.abandoned.load(Ordering::SeqCst),
        }
    }
}

#[async_trait]
impl QueueGateway for InMemoryGateway {
    async fn connect(&self, connection_string: &str) -> Result<Box<dyn QueueClient>, QueueError> {
        if connection_string.is_empty() {
            return Err(QueueError::Connect("connection string is empty".to_string()));
        }
        if self.inner.faults().fail_connect {
            return Err(QueueError::Connect("injected connect fault".to_string()));
        }

        bump(&self.inner.counters.connects);
        Ok(Box::new(MemoryClient {
            inner: Arc::clone(&self.inner),
            closed: false,
        }))
    }
}

struct MemoryClient {
    inner: Arc<Inner>,
    closed: bool,
}

impl MemoryClient {
    fn check_open(&self, queue_name: &str) -> Result<(), QueueError> {
        if self.closed {
            return Err(QueueError::Closed("client"));
        }
        if queue_name.is_empty() {
            return Err(QueueError::Connect("queue name is empty".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl QueueClient for MemoryClient {
    async fn open_sender(&self, queue_name: &str) -> Result<Box<dyn QueueSender>, QueueError> {
        self.check_open(queue_name)?;
        if self.inner.faults().fail_open_sender {
            return Err(QueueError::Transport("injected open sender fault".to_string()));
        }

        bump(&self.inner.counters.senders_opened);
        Ok(Box::new(MemorySender {
            inner: Arc::clone(&self.inner),
            queue: self.inner.queue(queue_name),
            closed: false,
        }))
    }

    async fn open_receiver(
        &self,
        queue_name: &str,
        options: &ReceiverOptions,
    ) -> Result<Box<dyn QueueReceiver>, QueueError> {
        self.check_open(queue_name)?;
        if self.inner.faults().fail_open_receiver {
            return Err(QueueError::Transport("injected open receiver fault".to_string()));
        }

        debug!(queue = queue_name, prefetch_count = options.prefetch_count, "memory_receiver_opened");
        bump(&self.inner.counters.receivers_opened);
        Ok(Box::new(MemoryReceiver {
            inner: Arc::clone(&self.inner),
            queue: self.inner.queue(queue_name),
            unsettled: Arc::new(Mutex::new(Vec::new())),
            running: None,
            closed: false,
        }))
    }

    async fn close(&mut self) {
        bump(&self.inner.counters.client_closes);
        self.closed = true;
    }
}

struct MemorySender {
    inner: Arc<Inner>,
    queue: Arc<MemoryQueue>,
    closed: bool,
}

#[async_trait]
impl QueueSender for MemorySender {
    fn create_batch(&self) -> MessageBatch {
        MessageBatch::new(self.inner.max_message_bytes)
    }

    async fn send(&self, batch: MessageBatch) -> Result<(), QueueError> {
        bump(&self.inner.counters.send_calls);
        if self.closed {
            return Err(QueueError::Closed("sender"));
        }
        let faults = self.inner.faults();
        if let Some(delay) = faults.send_delay {
            tokio::time::sleep(delay).await;
        }
        if faults.fail_send {
            return Err(QueueError::Transport("injected send fault".to_string()));
        }

        for message in batch.into_messages() {
            self.queue.push_back(StoredMessage {
                message_id: Some(message.message_id),
                body: Some(message.body),
                delivery_count: 0,
            });
            bump(&self.inner.counters.messages_sent);
        }
        Ok(())
    }

    async fn close(&mut self) {
        bump(&self.inner.counters.sender_closes);
        self.closed = true;
    }
}

struct RunningPump {
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

struct MemoryReceiver {
    inner: Arc<Inner>,
    queue: Arc<MemoryQueue>,
    /// Delivered but not acknowledged; returned to the queue on close
    unsettled: Arc<Mutex<Vec<StoredMessage>>>,
    running: Option<RunningPump>,
    closed: bool,
}

#[async_trait]
impl QueueReceiver for MemoryReceiver {
    async fn start(&mut self, handler: Arc<dyn MessageHandler>) -> Result<(), QueueError> {
        if self.closed {
            return Err(QueueError::Closed("receiver"));
        }
        if self.running.is_some() {
            return Ok(());
        }

        let faults = self.inner.faults();
        if faults.fail_start {
            return Err(QueueError::Transport("injected start fault".to_string()));
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(pump(
            Arc::clone(&self.inner),
            Arc::clone(&self.queue),
            Arc::clone(&self.unsettled),
            handler,
            faults.receive_errors,
            stop_rx,
        ));

        self.running = Some(RunningPump { stop_tx, task });
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), QueueError> {
        if let Some(running) = self.running.take() {
            let _ = running.stop_tx.send(());
            if let Err(e) = running.task.await {
                warn!(error = %e, "memory_pump_failed");
            }
        }
        Ok(())
    }

    async fn close(&mut self) {
        bump(&self.inner.counters.receiver_closes);
        let _ = self.stop().await;
        self.closed = true;

        let unsettled: Vec<StoredMessage> = lock(&self.unsettled).drain(..).collect();
        for message in unsettled.into_iter().rev() {
            self.queue.push_front(message);
        }
    }
}

async fn pump(
    inner: Arc<Inner>,
    queue: Arc<MemoryQueue>,
    unsettled: Arc<Mutex<Vec<StoredMessage>>>,
    handler: Arc<dyn MessageHandler>,
    receive_errors: usize,
    mut stop_rx: oneshot::Receiver<()>,
) {
    for attempt in 0..receive_errors {
        handler
            .handle_error(QueueError::Transport(format!(
                "injected receive fault #{}",
                attempt + 1
            )))
            .await;
    }

    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            mut stored = queue.next() => {
                stored.delivery_count += 1;
                let message = ReceivedMessage {
                    message_id: stored.message_id.clone(),
                    body: stored.body.clone(),
                    redelivered: stored.delivery_count > 1,
                };

                let inner = Arc::clone(&inner);
                let unsettled = Arc::clone(&unsettled);
                let handler = Arc::clone(&handler);
                in_flight.spawn(async move {
                    match handler.handle_message(message).await {
                        Disposition::Complete => bump(&inner.counters.completed),
                        Disposition::Abandon => {
                            bump(&inner.counters.abandoned);
                            lock(&unsettled).push(stored);
                        }
                    }
                });
            }
            Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
        }
    }

    while in_flight.join_next().await.is_some() {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::gateway::OutboundMessage;

    struct CompleteAll;

    #[async_trait]
    impl MessageHandler for CompleteAll {
        async fn handle_message(&self, _message: ReceivedMessage) -> Disposition {
            Disposition::Complete
        }

        async fn handle_error(&self, _error: QueueError) {}
    }

    struct AbandonAll;

    #[async_trait]
    impl MessageHandler for AbandonAll {
        async fn handle_message(&self, _message: ReceivedMessage) -> Disposition {
            Disposition::Abandon
        }

        async fn handle_error(&self, _error: QueueError) {}
    }

    #[tokio::test]
    async fn test_send_then_receive() {
        let gateway = InMemoryGateway::new();
        let mut client = gateway.connect(MEMORY_SCHEME).await.unwrap();

        let mut sender = client.open_sender("deliveries").await.unwrap();
        let mut batch = sender.create_batch();
        batch.try_add(OutboundMessage::new(b"one".to_vec())).unwrap();
        batch.try_add(OutboundMessage::new(b"two".to_vec())).unwrap();
        sender.send(batch).await.unwrap();
        sender.close().await;

        assert_eq!(gateway.queued("deliveries").len(), 2);

        let mut receiver = client
            .open_receiver("deliveries", &ReceiverOptions::default())
            .await
            .unwrap();
        receiver.start(Arc::new(CompleteAll)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        receiver.stop().await.unwrap();
        receiver.close().await;
        client.close().await;

        let stats = gateway.stats();
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.completed, 2);
        assert!(gateway.queued("deliveries").is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_messages_return_on_close() {
        let gateway = InMemoryGateway::new();
        gateway.enqueue("deliveries", Some(b"x".to_vec()));

        let mut client = gateway.connect(MEMORY_SCHEME).await.unwrap();
        let mut receiver = client
            .open_receiver("deliveries", &ReceiverOptions::default())
            .await
            .unwrap();
        receiver.start(Arc::new(AbandonAll)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        receiver.stop().await.unwrap();

        assert!(gateway.queued("deliveries").is_empty());

        receiver.close().await;
        client.close().await;

        let queued = gateway.queued("deliveries");
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].delivery_count, 1);
    }

    #[tokio::test]
    async fn test_closed_client_refuses_sender() {
        let gateway = InMemoryGateway::new();
        let mut client = gateway.connect(MEMORY_SCHEME).await.unwrap();
        client.close().await;

        let err = client.open_sender("deliveries").await.err().unwrap();
        assert!(matches!(err, QueueError::Closed("client")));
    }

    #[tokio::test]
    async fn test_injected_connect_fault() {
        let gateway = InMemoryGateway::new();
        gateway.inject(FaultPlan {
            fail_connect: true,
            ..Default::default()
        });

        assert!(gateway.connect(MEMORY_SCHEME).await.is_err());
        assert_eq!(gateway.stats().connects, 0);
    }
}
