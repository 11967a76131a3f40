use ratings_common::event::EventValidationError;
use ratings_common::store::StoreError;
use thiserror::Error;

use crate::dead_letter::DeadLetterError;

/// Enumeration of errors hit while projecting one envelope.
///
/// The retryable/non-retryable split is the whole error design: malformed
/// input will never parse better on a second read and goes straight to the
/// dead-letter topic, while store trouble is assumed transient and earns
/// bounded retries before ending up in the same place.
#[derive(Error, Debug)]
pub enum ProjectorError {
    #[error("failed to parse envelope: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error(transparent)]
    ValidationError(#[from] EventValidationError),
    #[error(transparent)]
    StoreError(#[from] StoreError),
}

impl ProjectorError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ProjectorError::ParseError(_) | ProjectorError::ValidationError(_) => false,
            ProjectorError::StoreError(_) => true,
        }
    }
}

/// Enumeration of errors that stop a worker rather than a single message.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("failed to forward an envelope to the dead-letter topic: {0}")]
    DeadLetterError(#[from] DeadLetterError),
    #[error("failed to store consumer offset: {0}")]
    AckError(#[from] ratings_common::consumer::AckErr),
}
