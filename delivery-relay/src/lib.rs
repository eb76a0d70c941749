//! Delivery Relay - delivery status updates through a durable queue.
//!
//! This library provides shared modules for the two binaries:
//! - `delivery-relay`: Web server accepting submissions and drain triggers
//! - `delivery-drain`: One-shot drain for cron or manual use
//!
//! ## Architecture
//!
//! ```text
//! POST /api/delivery_update → Producer → delivery update queue
//! trigger → Consumer → drain for a fixed window → acknowledge
//! ```

pub mod config;
pub mod consumer;
pub mod error;
pub mod producer;
pub mod queue;
pub mod web;

// Re-export commonly used types
pub use config::{Config, DrainOptions, QueueSettings};
pub use consumer::{Consumer, DrainOutcome, DrainReport, TriggerEvent};
pub use error::{DecodeError, QueueError, SubmissionError};
pub use producer::{Acknowledgement, Producer};
pub use queue::{gateway_for, DeliveryStatus, DeliveryUpdate, QueueGateway};
pub use web::AppState;
