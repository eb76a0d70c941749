//! Configuration module for environment variable parsing.
//!
//! Only the binaries call [`Config::from_env`]. The producer and consumer are
//! handed the resulting [`QueueSettings`] and [`DrainOptions`] explicitly and
//! never read the environment themselves.

use std::env;
use std::time::Duration;

use tracing::warn;

/// Default processing window for a single drain, in seconds.
pub const DEFAULT_DRAIN_WINDOW_SECS: u64 = 3;

/// Default maximum size of a single queue message (256 KiB).
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 256 * 1024;

/// Where to find the delivery update queue.
#[derive(Debug, Clone, Default)]
pub struct QueueSettings {
    /// Queue connection string (`amqp://...` or `memory://`)
    pub connection_string: String,

    /// Name of the delivery update queue
    pub queue_name: String,
}

/// How a single drain behaves.
#[derive(Debug, Clone)]
pub struct DrainOptions {
    /// How long the receiver stays active per trigger
    pub window: Duration,

    /// Maximum number of unacknowledged messages in flight
    pub prefetch_count: u16,
}

impl Default for DrainOptions {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(DEFAULT_DRAIN_WINDOW_SECS),
            prefetch_count: 16,
        }
    }
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub queue: QueueSettings,

    pub drain: DrainOptions,

    /// Largest message body the queue accepts
    pub max_message_bytes: usize,

    /// Port for the web server to listen on
    pub port: u16,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Missing connection details are not rejected here; they surface as a
    /// connect error the first time the queue is used.
    pub fn from_env() -> Self {
        Config {
            queue: QueueSettings {
                connection_string: env::var("DELIVERY_UPDATE_QUEUE_KEY").unwrap_or_default(),
                queue_name: env::var("DELIVERY_UPDATE_QUEUE_NAME").unwrap_or_default(),
            },

            drain: DrainOptions {
                window: Duration::from_secs(parse_or(
                    "DELIVERY_UPDATE_DRAIN_WINDOW_SECS",
                    DEFAULT_DRAIN_WINDOW_SECS,
                )),
                prefetch_count: parse_or("DELIVERY_UPDATE_PREFETCH", 16),
            },

            max_message_bytes: parse_or(
                "DELIVERY_UPDATE_MAX_MESSAGE_BYTES",
                DEFAULT_MAX_MESSAGE_BYTES,
            ),

            port: parse_or("PORT", 7071),
        }
    }
}

/// Parse a numeric variable, falling back to `default` when unset or invalid.
fn parse_or<T>(name: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    let raw = match env::var(name) {
        Ok(v) => v,
        Err(_) => return default,
    };

    match raw.trim().parse::<T>() {
        Ok(value) => value,
        Err(_) => {
            warn!(env_var = name, value = %raw, "Invalid numeric value, using default");
            default
        }
    }
}
