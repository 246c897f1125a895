//! AMQP (RabbitMQ) intake and change notification.
//!
//! Uses a durable topic exchange: record-submitted events arrive on
//! `records.submitted` and feed the intake queue; best-changed notifications
//! go out on `records.best-changed`.

use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use deadpool_lapin::{Manager, Pool, PoolError};
use lapin::{
    options::{
        BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, ExchangeKind,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::{BusError, ChangeNotifier, Result, RECORD_SUBMITTED_ROUTING_KEY};
use crate::queue::{IntakeQueue, UpdateRequest};

/// Exchange name for record events.
const RECORDS_EXCHANGE: &str = "pbproc.records";

/// Wire payload for a best-changed notification.
#[derive(Debug, Serialize, Deserialize)]
pub struct ChangedRecord {
    pub record_id: i64,
}

/// Configuration for an AMQP connection.
#[derive(Clone, Debug)]
pub struct AmqpConfig {
    /// AMQP connection URL (e.g., amqp://localhost:5672).
    pub url: String,
    /// Exchange name.
    pub exchange: String,
    /// Queue name for consuming (used by the intake).
    pub queue: Option<String>,
    /// Routing key for binding (used by the intake).
    pub routing_key: Option<String>,
}

impl AmqpConfig {
    /// Create config for publishing only.
    pub fn publisher(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            exchange: RECORDS_EXCHANGE.to_string(),
            queue: None,
            routing_key: None,
        }
    }

    /// Create config for consuming record-submitted events.
    pub fn intake(url: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            exchange: RECORDS_EXCHANGE.to_string(),
            queue: Some(queue.into()),
            routing_key: Some(RECORD_SUBMITTED_ROUTING_KEY.to_string()),
        }
    }
}

/// Create a connection pool and declare the exchange.
async fn connect(config: &AmqpConfig) -> Result<Pool> {
    let manager = Manager::new(config.url.clone(), Default::default());
    let pool = Pool::builder(manager)
        .max_size(10)
        .build()
        .map_err(|e| BusError::Connection(format!("Failed to create pool: {}", e)))?;

    let conn = pool
        .get()
        .await
        .map_err(|e| BusError::Connection(format!("Failed to connect: {}", e)))?;

    let channel = conn
        .create_channel()
        .await
        .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))?;

    channel
        .exchange_declare(
            &config.exchange,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| BusError::Connection(format!("Failed to declare exchange: {}", e)))?;

    info!(
        exchange = %config.exchange,
        url = %config.url,
        "Connected to AMQP"
    );

    Ok(pool)
}

async fn get_channel(pool: &Pool) -> Result<Channel> {
    let conn = pool.get().await.map_err(|e: PoolError| {
        BusError::Connection(format!("Failed to get connection from pool: {}", e))
    })?;

    conn.create_channel()
        .await
        .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))
}

// ============================================================================
// Outbound: change notifications
// ============================================================================

/// AMQP change notifier publishing to the records exchange.
pub struct AmqpChangeNotifier {
    pool: Pool,
    config: AmqpConfig,
}

impl AmqpChangeNotifier {
    /// Create a new AMQP change notifier.
    pub async fn new(config: AmqpConfig) -> Result<Self> {
        let pool = connect(&config).await?;
        Ok(Self { pool, config })
    }
}

#[async_trait::async_trait]
impl ChangeNotifier for AmqpChangeNotifier {
    #[tracing::instrument(name = "bus.publish", skip(self))]
    async fn publish(&self, routing_key: &str, record_id: i64) -> Result<()> {
        const MAX_RETRIES: usize = 5;

        let payload = serde_json::to_vec(&ChangedRecord { record_id })?;

        // Exponential backoff with jitter to prevent thundering herd
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(5))
            .with_max_times(MAX_RETRIES)
            .with_jitter()
            .build();

        let mut last_error = None;

        for (attempt, delay) in std::iter::once(Duration::ZERO).chain(backoff).enumerate() {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
            }

            // Fresh channel per attempt (handles reconnection)
            let channel = match get_channel(&self.pool).await {
                Ok(ch) => ch,
                Err(e) => {
                    error!(
                        attempt = attempt + 1,
                        max_retries = MAX_RETRIES,
                        error = %e,
                        "Failed to get channel, retrying..."
                    );
                    last_error = Some(e);
                    continue;
                }
            };

            let properties = BasicProperties::default()
                .with_content_type("application/json".into())
                .with_delivery_mode(2); // persistent

            match channel
                .basic_publish(
                    &self.config.exchange,
                    routing_key,
                    BasicPublishOptions::default(),
                    &payload,
                    properties,
                )
                .await
            {
                Ok(confirm) => match confirm.await {
                    Ok(_) => {
                        debug!(
                            exchange = %self.config.exchange,
                            routing_key = %routing_key,
                            record_id,
                            "Published change notification"
                        );
                        return Ok(());
                    }
                    Err(e) => {
                        error!(
                            attempt = attempt + 1,
                            max_retries = MAX_RETRIES,
                            error = %e,
                            "Publish confirmation failed, retrying..."
                        );
                        last_error = Some(BusError::Publish(format!(
                            "Publish confirmation failed: {}",
                            e
                        )));
                    }
                },
                Err(e) => {
                    error!(
                        attempt = attempt + 1,
                        max_retries = MAX_RETRIES,
                        error = %e,
                        "Publish failed, retrying..."
                    );
                    last_error = Some(BusError::Publish(format!("Failed to publish: {}", e)));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| BusError::Publish("Max retries exceeded".to_string())))
    }
}

// ============================================================================
// Inbound: record-submitted intake
// ============================================================================

/// AMQP subscriber that feeds decoded update requests into the intake queue.
pub struct AmqpIntake {
    pool: Pool,
    config: AmqpConfig,
    intake: Arc<IntakeQueue>,
}

impl AmqpIntake {
    /// Create a new AMQP intake. Use `AmqpConfig::intake` for the config.
    pub async fn new(config: AmqpConfig, intake: Arc<IntakeQueue>) -> Result<Self> {
        if config.queue.is_none() {
            return Err(BusError::Subscribe(
                "Cannot consume: no queue configured. Use AmqpConfig::intake()".to_string(),
            ));
        }
        let pool = connect(&config).await?;
        Ok(Self {
            pool,
            config,
            intake,
        })
    }

    /// Declare the queue, bind it, and start consuming in a background task
    /// that automatically reconnects on failure.
    pub fn start_consuming(&self) -> Result<()> {
        let queue = self
            .config
            .queue
            .clone()
            .ok_or_else(|| BusError::Subscribe("No queue configured".to_string()))?;
        let routing_key = self
            .config
            .routing_key
            .clone()
            .ok_or_else(|| BusError::Subscribe("No routing key configured".to_string()))?;

        let exchange = self.config.exchange.clone();
        let pool = self.pool.clone();
        let intake = Arc::clone(&self.intake);

        tokio::spawn(async move {
            Self::consume_with_reconnect(pool, exchange, queue, routing_key, intake).await;
        });

        Ok(())
    }

    /// Consumer loop with automatic reconnection and exponential backoff.
    async fn consume_with_reconnect(
        pool: Pool,
        exchange: String,
        queue: String,
        routing_key: String,
        intake: Arc<IntakeQueue>,
    ) {
        use futures::StreamExt;

        let backoff_builder = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(30))
            .with_jitter();

        let mut backoff_iter = backoff_builder.build();

        loop {
            match Self::setup_consumer(&pool, &exchange, &queue, &routing_key).await {
                Ok(mut consumer) => {
                    info!(
                        queue = %queue,
                        routing_key = %routing_key,
                        "Intake consumer connected, processing messages"
                    );
                    // Reset backoff on successful connection
                    backoff_iter = backoff_builder.build();

                    while let Some(delivery) = consumer.next().await {
                        match delivery {
                            Ok(delivery) => {
                                Self::process_delivery(delivery, &intake).await;
                            }
                            Err(e) => {
                                error!(error = %e, "Consumer delivery error, will reconnect");
                                break;
                            }
                        }
                    }

                    info!(queue = %queue, "Intake consumer stream ended, reconnecting...");
                }
                Err(e) => {
                    let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
                    error!(
                        error = %e,
                        backoff_ms = %delay.as_millis(),
                        queue = %queue,
                        "Failed to set up intake consumer, retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            }

            // Brief pause before reconnecting after stream end (not error)
            let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
            tokio::time::sleep(delay).await;
        }
    }

    /// Set up consumer channel, queue, and bindings.
    async fn setup_consumer(
        pool: &Pool,
        exchange: &str,
        queue: &str,
        routing_key: &str,
    ) -> Result<lapin::Consumer> {
        let channel = get_channel(pool).await?;

        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to declare queue: {}", e)))?;

        channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to bind queue: {}", e)))?;

        let consumer = channel
            .basic_consume(
                queue,
                "pbproc-intake",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to start consumer: {}", e)))?;

        Ok(consumer)
    }

    /// Decode one delivery and enqueue it.
    async fn process_delivery(delivery: lapin::message::Delivery, intake: &Arc<IntakeQueue>) {
        match serde_json::from_slice::<UpdateRequest>(&delivery.data) {
            Ok(request) => {
                debug!(
                    participant_id = request.participant_id,
                    level_id = request.level_id,
                    "Received update request"
                );
                intake.enqueue(request);

                if let Err(e) = delivery.ack(Default::default()).await {
                    error!(error = %e, "Failed to ack message");
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to decode update request");
                // Don't requeue malformed messages
                let _ = delivery.reject(Default::default()).await;
            }
        }
    }
}
