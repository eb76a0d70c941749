//! Message schema for the delivery update queue.
//!
//! This module defines:
//! - `DeliveryStatus`: the inbound HTTP payload (`{"status": "..."}`)
//! - `DeliveryUpdate`: the queue message (`{"time": "...", "status": "..."}`)
//!
//! `time` is stamped by the producer when the update is enqueued. The inbound
//! schema carries no timestamp, so a caller cannot supply one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

/// Inbound delivery status submitted over HTTP.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeliveryStatus {
    /// Free-form status, e.g. "delivered"
    #[serde(alias = "Status")]
    pub status: String,
}

/// Delivery update as it travels through the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryUpdate {
    /// When the update was enqueued
    #[serde(alias = "Time")]
    pub time: DateTime<Utc>,
    /// Status copied from the inbound submission
    #[serde(alias = "Status")]
    pub status: String,
}

impl DeliveryUpdate {
    /// Stamp a status with the current wall-clock time.
    pub fn stamp(status: DeliveryStatus) -> Self {
        Self::at(status, Utc::now())
    }

    pub fn at(status: DeliveryStatus, time: DateTime<Utc>) -> Self {
        Self {
            time,
            status: status.status,
        }
    }
}

/// Parse an inbound request body into a `DeliveryStatus`.
pub fn decode_status(raw: &[u8]) -> Result<DeliveryStatus, DecodeError> {
    let status: DeliveryStatus = serde_json::from_slice(raw)?;
    if status.status.is_empty() {
        return Err(DecodeError::EmptyStatus);
    }
    Ok(status)
}

/// Serialize an update into a queue message body.
pub fn encode_update(update: &DeliveryUpdate) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(update)
}

/// Parse a queue message body back into a `DeliveryUpdate`.
pub fn decode_update(raw: &[u8]) -> Result<DeliveryUpdate, DecodeError> {
    let update: DeliveryUpdate = serde_json::from_slice(raw)?;
    if update.status.is_empty() {
        return Err(DecodeError::EmptyStatus);
    }
    Ok(update)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_decode_status() {
        let status = decode_status(br#"{"status": "delivered"}"#).unwrap();
        assert_eq!(status.status, "delivered");
    }

    #[test]
    fn test_decode_status_ignores_caller_time() {
        let status =
            decode_status(br#"{"status": "delivered", "time": "1999-01-01T00:00:00Z"}"#).unwrap();
        let update = DeliveryUpdate::stamp(status);
        assert!(update.time.timestamp() > 946_684_800);
    }

    #[test]
    fn test_decode_status_missing_field() {
        let err = decode_status(br#"{"state": "delivered"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
        assert!(err.to_string().contains("status"));
    }

    #[test]
    fn test_decode_status_empty() {
        let err = decode_status(br#"{"status": ""}"#).unwrap_err();
        assert!(matches!(err, DecodeError::EmptyStatus));
    }

    #[test]
    fn test_decode_status_not_json() {
        assert!(decode_status(b"status=delivered").is_err());
        assert!(decode_status(b"").is_err());
    }

    #[test]
    fn test_decode_status_pascal_case() {
        let status = decode_status(br#"{"Status": "out for delivery"}"#).unwrap();
        assert_eq!(status.status, "out for delivery");
    }

    #[test]
    fn test_encode_wire_shape() {
        let time = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        let update = DeliveryUpdate::at(
            DeliveryStatus {
                status: "delivered".to_string(),
            },
            time,
        );

        let json = String::from_utf8(encode_update(&update).unwrap()).unwrap();
        assert_eq!(json, r#"{"time":"2024-03-01T12:30:00Z","status":"delivered"}"#);
    }

    #[test]
    fn test_update_round_trip_keeps_subsecond_time() {
        let update = DeliveryUpdate::stamp(DeliveryStatus {
            status: "left at front door \u{1F4E6}".to_string(),
        });

        let decoded = decode_update(&encode_update(&update).unwrap()).unwrap();
        assert_eq!(decoded, update);
    }

    #[test]
    fn test_decode_update_rejects_garbage() {
        assert!(decode_update(b"not json").is_err());
        assert!(decode_update(br#"{"status": "delivered"}"#).is_err());
    }
}
