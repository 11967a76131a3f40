use async_trait::async_trait;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use thiserror::Error;
use tracing::error;

use ratings_common::kafka::KafkaContext;

#[derive(Error, Debug)]
pub enum DeadLetterError {
    #[error("failed to produce to dead-letter topic: {0}")]
    KafkaProduceError(#[from] KafkaError),
    #[error("dead-letter delivery future canceled")]
    Canceled,
}

/// The side channel for envelopes the projector gives up on: malformed
/// payloads and messages that exhausted their retries.
///
/// The contract is narrow on purpose. The payload goes out byte-for-byte as
/// it arrived, under its original key, and nothing here ever reads the topic
/// back; remediation is a manual affair.
#[async_trait]
pub trait DeadLetterSink {
    async fn send(&self, payload: &[u8], key: Option<&[u8]>) -> Result<(), DeadLetterError>;
}

// Workers share one sink handle; delegate through `Arc` so they can.
#[async_trait]
impl<D: DeadLetterSink + Send + Sync> DeadLetterSink for std::sync::Arc<D> {
    async fn send(&self, payload: &[u8], key: Option<&[u8]>) -> Result<(), DeadLetterError> {
        self.as_ref().send(payload, key).await
    }
}

pub struct KafkaDeadLetterSink {
    producer: FutureProducer<KafkaContext>,
    topic: String,
}

impl KafkaDeadLetterSink {
    pub fn new(producer: FutureProducer<KafkaContext>, topic: String) -> Self {
        Self { producer, topic }
    }
}

#[async_trait]
impl DeadLetterSink for KafkaDeadLetterSink {
    async fn send(&self, payload: &[u8], key: Option<&[u8]>) -> Result<(), DeadLetterError> {
        let delivery = self
            .producer
            .send(
                FutureRecord {
                    topic: self.topic.as_str(),
                    payload: Some(payload),
                    partition: None,
                    key,
                    timestamp: None,
                    headers: None,
                },
                Timeout::Never,
            )
            .await;

        match delivery {
            Ok(_) => Ok(()),
            Err((kafka_error, _)) => {
                error!(
                    topic = %self.topic,
                    "failed to dead-letter envelope: {}",
                    kafka_error
                );
                Err(DeadLetterError::KafkaProduceError(kafka_error))
            }
        }
    }
}
