//! Broker intake and change notification.
//!
//! This module contains:
//! - `ChangeNotifier` trait: best-effort broadcast of changed record ids
//! - Messaging configuration types
//! - Implementations: AMQP (RabbitMQ), Mock

use async_trait::async_trait;
use serde::Deserialize;

pub mod amqp;
pub mod mock;

pub use amqp::{AmqpChangeNotifier, AmqpConfig, AmqpIntake};
pub use mock::MockChangeNotifier;

/// Routing key for best-changed notifications.
pub const BEST_CHANGED_ROUTING_KEY: &str = "records.best-changed";

/// Routing key pattern the intake queue binds to.
pub const RECORD_SUBMITTED_ROUTING_KEY: &str = "records.submitted";

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Failed to decode message: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Receives the ids of records whose best-flag changed, for downstream
/// broadcast.
///
/// The worker calls this once per changed id, only after the store
/// transaction committed. Publishing is fire-and-forget: failures are logged
/// by the caller and never roll back the committed store change.
#[async_trait]
pub trait ChangeNotifier: Send + Sync {
    /// Publish a single changed record id under the given routing key.
    async fn publish(&self, routing_key: &str, record_id: i64) -> Result<()>;
}

/// Messaging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// AMQP connection URL.
    pub url: String,
    /// Queue name for the record-submitted intake.
    pub intake_queue: String,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            intake_queue: "pbproc-intake".to_string(),
        }
    }
}
