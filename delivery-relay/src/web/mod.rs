//! Web server module.
//!
//! This module provides the HTTP surface of the relay:
//! - Delivery status submissions, enqueued by the producer
//! - Drain triggers, served by the consumer
//!
//! Every request gets its own queue resources; nothing is pooled between
//! requests.

pub mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

pub use handlers::{
    delivery_update, delivery_update_sub, delivery_update_sub_validation, health, AppState,
    HealthResponse,
};

/// Build the router with all routes and request tracing.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/delivery_update", post(delivery_update))
        .route(
            "/api/delivery_update_sub",
            post(delivery_update_sub).options(delivery_update_sub_validation),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
