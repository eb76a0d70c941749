//! Delivery Relay web server.
//!
//! Accepts delivery status submissions over HTTP and enqueues them, and runs
//! a bounded drain of the queue whenever a trigger event is posted.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::{net::TcpListener, signal};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use delivery_relay::{gateway_for, web, AppState, Config, Consumer, Producer};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("web_server_starting");

    // Load configuration
    let config = Config::from_env();
    info!(
        port = config.port,
        connection_string_set = !config.queue.connection_string.is_empty(),
        queue_name = %config.queue.queue_name,
        drain_window_ms = config.drain.window.as_millis() as u64,
        max_message_bytes = config.max_message_bytes,
        "config_loaded"
    );

    // Producer and consumer share one gateway; each request opens its own resources
    let gateway = gateway_for(&config.queue.connection_string, config.max_message_bytes);
    let producer = Producer::new(gateway.clone(), config.queue.clone());
    let consumer = Consumer::new(gateway, config.queue.clone(), config.drain.clone());

    let app = web::router(AppState::new(producer, consumer));

    // Bind to address
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, "web_server_listening");

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("web_server_shutdown_complete");

    Ok(())
}

/// Create a future that completes when a shutdown signal is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }

    info!("web_server_shutting_down");
}
