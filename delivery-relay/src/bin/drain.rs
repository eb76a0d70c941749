//! Delivery Relay one-shot drain.
//!
//! Runs a single bounded drain of the delivery update queue and exits.
//!
//! ```text
//! delivery-drain [EVENT_TYPE] [SUBJECT]
//! ```
//!
//! The exit code is non-zero when the drain could not reach the queue.

use anyhow::{bail, Result};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use delivery_relay::{gateway_for, Config, Consumer, DrainOutcome, TriggerEvent};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("drain_starting");

    let config = Config::from_env();
    info!(
        queue_name = %config.queue.queue_name,
        drain_window_ms = config.drain.window.as_millis() as u64,
        prefetch_count = config.drain.prefetch_count,
        "config_loaded"
    );

    let mut args = std::env::args().skip(1);
    let event = TriggerEvent {
        event_type: args.next().unwrap_or_else(|| "manual".to_string()),
        subject: args.next().unwrap_or_default(),
        ..Default::default()
    };

    let gateway = gateway_for(&config.queue.connection_string, config.max_message_bytes);
    let consumer = Consumer::new(gateway, config.queue, config.drain);

    let report = consumer.drain_on_trigger(&event).await;
    println!("{}", serde_json::to_string(&report)?);

    if report.outcome != DrainOutcome::Drained {
        bail!("drain ended with {:?}", report.outcome);
    }

    info!("drain_finished");
    Ok(())
}
