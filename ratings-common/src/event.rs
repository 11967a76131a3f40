use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Discriminator tag carried by every rating envelope. Kept as a field so new
/// fact kinds can share the topic later without a breaking change.
pub const RATING_SUBMITTED_EVENT_TYPE: &str = "RatingSubmittedEvent";

/// Rating value bounds, inclusive.
pub const MIN_RATING: u8 = 1;
pub const MAX_RATING: u8 = 5;

/// Default topic names. Overridable through the consumer/producer configs.
pub const RATING_EVENTS_TOPIC: &str = "rating_events";
pub const RATING_EVENTS_DEAD_LETTER_TOPIC: &str = "rating_events_dlt";

/// Enumeration of reasons an otherwise well-formed envelope is unacceptable.
/// These are never retried: the payload will not get better on a second read.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum EventValidationError {
    #[error("event {0} has an empty productId, cannot be partitioned")]
    EmptyProductId(Uuid),
    #[error("event {event_id} carries rating {rating}, outside [{MIN_RATING},{MAX_RATING}]")]
    RatingOutOfRange { event_id: Uuid, rating: u8 },
}

/// The immutable fact that one rating was submitted, as published by the
/// write path after the raw review is durably stored.
///
/// Field names are camelCase on the wire to stay compatible with the JSON
/// the rest of the platform produces and consumes. Missing required fields
/// fail deserialization outright and are handled as malformed payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RatingSubmittedEvent {
    pub event_id: Uuid,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub submission_id: String,
    pub product_id: String,
    pub rating: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl RatingSubmittedEvent {
    /// Create a fresh envelope for a just-persisted review. Assigns the
    /// event id and timestamp; the caller provides everything else.
    pub fn new(
        submission_id: impl Into<String>,
        product_id: impl Into<String>,
        rating: u8,
        user_id: Option<String>,
    ) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            event_type: RATING_SUBMITTED_EVENT_TYPE.to_owned(),
            timestamp: Utc::now(),
            submission_id: submission_id.into(),
            product_id: product_id.into(),
            rating,
            user_id,
        }
    }

    /// The Kafka partition key. All events for one product land on the same
    /// partition, which is what lets the projector fold them in order.
    pub fn partition_key(&self) -> &str {
        &self.product_id
    }

    /// Check the constraints typed deserialization cannot express.
    pub fn validate(&self) -> Result<(), EventValidationError> {
        if self.product_id.trim().is_empty() {
            return Err(EventValidationError::EmptyProductId(self.event_id));
        }
        if !(MIN_RATING..=MAX_RATING).contains(&self.rating) {
            return Err(EventValidationError::RatingOutOfRange {
                event_id: self.event_id,
                rating: self.rating,
            });
        }
        Ok(())
    }
}
