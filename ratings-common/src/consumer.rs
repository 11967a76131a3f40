use std::sync::{Arc, Weak};

use rdkafka::{
    consumer::{Consumer, StreamConsumer},
    error::KafkaError,
    ClientConfig, Message,
};

use crate::kafka::{ConsumerConfig, KafkaConfig};

/// A stream consumer pinned to the rating events topic.
///
/// Offset *storing* is explicit: nothing is stored until the caller settles
/// the delivery, so a crash between fetch and settle redelivers the message.
/// The background auto-commit only ever commits what was stored.
#[derive(Clone)]
pub struct RatingStreamConsumer {
    inner: Arc<Inner>,
}

struct Inner {
    consumer: StreamConsumer,
    topic: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RecvErr {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("received empty payload")]
    Empty,
}

#[derive(Debug, thiserror::Error)]
pub enum AckErr {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("consumer gone")]
    Gone,
}

/// One message pulled off the stream, with its raw payload preserved so a
/// malformed or poisonous envelope can be forwarded verbatim to the
/// dead-letter topic.
pub struct Delivery {
    pub payload: Vec<u8>,
    pub key: Option<Vec<u8>>,
    pub partition: i32,
    pub offset: i64,
    ack: Ack,
}

impl Delivery {
    /// Mark this message as durably handled. Call only after the aggregate
    /// write succeeded or the payload was routed to the dead-letter topic.
    pub fn ack(self) -> Result<(), AckErr> {
        self.ack.store()
    }
}

struct Ack {
    handle: Weak<Inner>,
    partition: i32,
    offset: i64,
}

impl Ack {
    fn store(self) -> Result<(), AckErr> {
        let inner = self.handle.upgrade().ok_or(AckErr::Gone)?;
        inner
            .consumer
            .store_offset(&inner.topic, self.partition, self.offset)?;
        Ok(())
    }
}

impl RatingStreamConsumer {
    pub fn new(
        common_config: &KafkaConfig,
        consumer_config: &ConsumerConfig,
    ) -> Result<Self, KafkaError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &common_config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("group.id", &consumer_config.kafka_consumer_group)
            .set(
                "auto.offset.reset",
                &consumer_config.kafka_consumer_offset_reset,
            );

        client_config.set("enable.auto.offset.store", "false");

        if common_config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        let consumer: StreamConsumer = client_config.create()?;
        consumer.subscribe(&[consumer_config.kafka_consumer_topic.as_str()])?;

        let inner = Inner {
            consumer,
            topic: consumer_config.kafka_consumer_topic.clone(),
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Receive the next message from the subscribed topic.
    ///
    /// Empty payloads are acknowledged on the spot: there is nothing to
    /// project and nothing worth dead-lettering.
    pub async fn recv(&self) -> Result<Delivery, RecvErr> {
        let message = self.inner.consumer.recv().await?;

        let ack = Ack {
            handle: Arc::downgrade(&self.inner),
            partition: message.partition(),
            offset: message.offset(),
        };

        let Some(payload) = message.payload() else {
            // Failing to store the offset of a tombstone means Kafka is gone,
            // and if Kafka is gone so are we.
            ack.store().expect("failed to store offset");
            return Err(RecvErr::Empty);
        };

        Ok(Delivery {
            payload: payload.to_vec(),
            key: message.key().map(<[u8]>::to_vec),
            partition: message.partition(),
            offset: message.offset(),
            ack,
        })
    }
}
