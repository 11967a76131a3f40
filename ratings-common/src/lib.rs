//! Shared building blocks for the ratings aggregation pipeline: the event
//! envelope, the pure fold, the materialized stats store, and the Kafka,
//! retry, health and metrics plumbing used by the publisher and projector.

pub mod aggregate;
pub mod consumer;
pub mod event;
pub mod health;
pub mod kafka;
pub mod metrics;
pub mod retry;
pub mod store;
