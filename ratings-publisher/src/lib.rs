//! The write path's outbound edge: publish `RatingSubmittedEvent` envelopes
//! to the rating events topic, keyed by product so every product's events
//! land on one ordered partition.
//!
//! The publisher promises nothing beyond "if `publish` returns `Ok`, the
//! broker has acknowledged the event on all replicas". It never touches the
//! stats store and never re-validates business rules; the caller owns
//! retry/compensation when publishing fails.

use async_trait::async_trait;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use thiserror::Error;
use tracing::{error, info};

use ratings_common::event::RatingSubmittedEvent;
use ratings_common::kafka::KafkaContext;

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("event {0} has an empty productId, cannot pick a partition")]
    EmptyPartitionKey(uuid::Uuid),
    #[error("failed to serialize event: {error}")]
    SerializationError { error: serde_json::Error },
    #[error("failed to produce to kafka: {error}")]
    KafkaProduceError { error: KafkaError },
    #[error("failed to produce to kafka (delivery future canceled)")]
    KafkaProduceCanceled,
}

/// Broker confirmation for one published event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub partition: i32,
    pub offset: i64,
}

/// Where rating events go after the review is durably stored.
///
/// A trait so the write path can be tested without a broker, in the same way
/// the projector tests swap its store.
#[async_trait]
pub trait RatingEventSink {
    async fn publish(&self, event: &RatingSubmittedEvent) -> Result<Ack, PublishError>;
}

/// Logs events instead of producing them. Handy for local development.
pub struct PrintSink {}

#[async_trait]
impl RatingEventSink for PrintSink {
    async fn publish(&self, event: &RatingSubmittedEvent) -> Result<Ack, PublishError> {
        if event.partition_key().trim().is_empty() {
            return Err(PublishError::EmptyPartitionKey(event.event_id));
        }

        info!("rating event: {:?}", event);
        metrics::counter!("rating_events_published_total").increment(1);

        Ok(Ack {
            partition: 0,
            offset: -1,
        })
    }
}

/// Produces rating events to Kafka and waits for all-replica acknowledgment.
///
/// Transient broker errors are retried inside rdkafka within the configured
/// message timeout (bounded attempts, idempotent production, one in-flight
/// request); anything that survives that surfaces here synchronously.
pub struct KafkaSink {
    producer: FutureProducer<KafkaContext>,
    topic: String,
}

impl KafkaSink {
    pub fn new(producer: FutureProducer<KafkaContext>, topic: String) -> Self {
        Self { producer, topic }
    }
}

#[async_trait]
impl RatingEventSink for KafkaSink {
    async fn publish(&self, event: &RatingSubmittedEvent) -> Result<Ack, PublishError> {
        // Same trimmed check the projector validates with; a whitespace-only
        // key must never make it onto the topic.
        if event.partition_key().trim().is_empty() {
            return Err(PublishError::EmptyPartitionKey(event.event_id));
        }

        let payload = serde_json::to_string(event).map_err(|error| {
            error!("failed to serialize event {}: {}", event.event_id, error);
            PublishError::SerializationError { error }
        })?;

        let delivery = self
            .producer
            .send(
                FutureRecord {
                    topic: self.topic.as_str(),
                    payload: Some(&payload),
                    partition: None,
                    key: Some(event.partition_key()),
                    timestamp: None,
                    headers: None,
                },
                Timeout::Never,
            )
            .await;

        match delivery {
            Ok((partition, offset)) => {
                metrics::counter!("rating_events_published_total").increment(1);
                info!(
                    event_id = %event.event_id,
                    product_id = %event.product_id,
                    partition,
                    offset,
                    "published rating event"
                );
                Ok(Ack { partition, offset })
            }
            Err((error, _)) => {
                metrics::counter!("rating_events_publish_failures_total").increment(1);
                error!(
                    event_id = %event.event_id,
                    product_id = %event.product_id,
                    "failed to publish rating event: {}",
                    error
                );
                Err(PublishError::KafkaProduceError { error })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn print_sink_acknowledges_valid_events() {
        let sink = PrintSink {};
        let event = RatingSubmittedEvent::new("sub-1", "product-1", 5, None);

        let ack = sink.publish(&event).await.unwrap();
        assert_eq!(ack.partition, 0);
    }

    #[tokio::test]
    async fn events_without_a_partition_key_are_refused() {
        let sink = PrintSink {};

        for product_id in ["", "   "] {
            let event = RatingSubmittedEvent::new("sub-1", product_id, 5, None);

            let result = sink.publish(&event).await;
            assert!(matches!(result, Err(PublishError::EmptyPartitionKey(_))));
        }
    }
}
