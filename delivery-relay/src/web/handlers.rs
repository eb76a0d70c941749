//! HTTP endpoint handlers.
//!
//! - `POST /api/delivery_update`: hands the raw body to the [`Producer`]
//! - `POST /api/delivery_update_sub`: runs one [`Consumer`] drain per event
//! - `OPTIONS /api/delivery_update_sub`: CloudEvents webhook validation

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use tracing::{info, warn};

use crate::consumer::{Consumer, DrainReport, TriggerEvent};
use crate::producer::Producer;

pub const SENT_MESSAGE: &str = "Delivery Update Sent!";
pub const MALFORMED_MESSAGE: &str = "Incorrectly formatted request Body";
pub const SEND_FAILED_MESSAGE: &str = "Failed to send delivery update";

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub producer: Arc<Producer>,
    pub consumer: Arc<Consumer>,
}

impl AppState {
    pub fn new(producer: Producer, consumer: Consumer) -> Self {
        Self {
            producer: Arc::new(producer),
            consumer: Arc::new(consumer),
        }
    }
}

// =============================================================================
// Health Check
// =============================================================================

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// =============================================================================
// Delivery Update Submission
// =============================================================================

/// Delivery update submission endpoint.
///
/// A malformed body is answered with 200 and an explanatory text, the same
/// status as a successful submission.
pub async fn delivery_update(
    State(state): State<AppState>,
    body: Bytes,
) -> (StatusCode, &'static str) {
    match state.producer.handle_submission(&body).await {
        Ok(ack) => {
            info!(status = %ack.update.status, "delivery_update_accepted");
            (StatusCode::OK, SENT_MESSAGE)
        }
        Err(e) if e.is_client_error() => {
            warn!(error = %e, "delivery_update_rejected");
            (StatusCode::OK, MALFORMED_MESSAGE)
        }
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, SEND_FAILED_MESSAGE),
    }
}

// =============================================================================
// Drain Trigger
// =============================================================================

/// Drain trigger endpoint.
///
/// Any body triggers a drain; the event is only read for logging. Runs a
/// full drain window before responding.
pub async fn delivery_update_sub(
    State(state): State<AppState>,
    body: Bytes,
) -> Json<DrainReport> {
    let event = TriggerEvent::from_body(&body);
    Json(state.consumer.drain_on_trigger(&event).await)
}

/// CloudEvents abuse-protection handshake for webhook subscriptions.
///
/// Echoes the requesting origin back as the allowed origin.
pub async fn delivery_update_sub_validation(headers: HeaderMap) -> impl IntoResponse {
    let mut response = HeaderMap::new();

    match headers.get("webhook-request-origin") {
        Some(origin) => {
            info!(origin = ?origin, "webhook_validation_requested");
            response.insert("webhook-allowed-origin", origin.clone());
            response.insert("webhook-allowed-rate", HeaderValue::from_static("*"));
            (StatusCode::OK, response)
        }
        None => {
            warn!("webhook_validation_missing_origin");
            (StatusCode::BAD_REQUEST, response)
        }
    }
}
