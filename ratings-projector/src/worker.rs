use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use ratings_common::aggregate::{self, ProductStats};
use ratings_common::consumer::{Delivery, RatingStreamConsumer, RecvErr};
use ratings_common::event::RatingSubmittedEvent;
use ratings_common::health::HealthHandle;
use ratings_common::retry::RetryPolicy;
use ratings_common::store::StatsStore;

use crate::dead_letter::DeadLetterSink;
use crate::error::{ProjectorError, WorkerError};
use crate::metrics_consts::{
    DEAD_LETTERED, EMPTY_PAYLOADS, EVENTS_PROJECTED, EVENTS_RECEIVED, INVALID_ENVELOPES,
    MALFORMED_ENVELOPES, PROJECTION_TIME, RETRIES_ATTEMPTED,
};

/// How one envelope left the pipeline.
#[derive(Debug)]
pub enum Outcome {
    /// Folded into the aggregate and persisted.
    Applied(ProductStats),
    /// Forwarded verbatim to the dead-letter topic.
    DeadLettered(DeadLetterReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterReason {
    /// The payload did not deserialize into a rating envelope.
    Malformed,
    /// The envelope deserialized but failed validation. Not retried.
    Invalid,
    /// A transient error survived every allowed attempt.
    RetriesExhausted,
}

/// Applies rating envelopes to the stats store, one at a time.
///
/// Generic over the store and the dead-letter sink so the retry and
/// dead-letter control flow can be tested without Kafka or Postgres.
pub struct Projector<S, D> {
    store: S,
    dead_letter: D,
    retry_policy: RetryPolicy,
}

impl<S, D> Projector<S, D>
where
    S: StatsStore,
    D: DeadLetterSink,
{
    pub fn new(store: S, dead_letter: D, retry_policy: RetryPolicy) -> Self {
        Self {
            store,
            dead_letter,
            retry_policy,
        }
    }

    /// Project one envelope.
    ///
    /// Returns `Ok` whenever the message has been fully dealt with, whether
    /// by persisting the fold or by dead-lettering, and the caller may store
    /// the offset. Returns `Err` only when the dead-letter publish itself
    /// failed, in which case the offset must stay unstored so the envelope
    /// is redelivered.
    pub async fn process(
        &self,
        payload: &[u8],
        key: Option<&[u8]>,
    ) -> Result<Outcome, WorkerError> {
        let event: RatingSubmittedEvent = match serde_json::from_slice(payload) {
            Ok(event) => event,
            Err(err) => {
                warn!("dead-lettering malformed envelope: {}", err);
                metrics::counter!(MALFORMED_ENVELOPES).increment(1);
                return self.dead_letter(payload, key, DeadLetterReason::Malformed).await;
            }
        };

        if let Err(err) = event.validate() {
            warn!("dead-lettering invalid envelope: {}", err);
            metrics::counter!(INVALID_ENVELOPES).increment(1);
            return self.dead_letter(payload, key, DeadLetterReason::Invalid).await;
        }

        let mut attempt: u32 = 1;
        loop {
            match self.apply(&event).await {
                Ok(stats) => {
                    metrics::counter!(EVENTS_PROJECTED).increment(1);
                    info!(
                        event_id = %event.event_id,
                        product_id = %event.product_id,
                        review_count = stats.review_count,
                        average_rating = ?stats.average_rating,
                        "projected rating event"
                    );
                    return Ok(Outcome::Applied(stats));
                }
                Err(err) if err.is_retryable() && self.retry_policy.should_retry(attempt) => {
                    let backoff = self.retry_policy.time_until_next_retry(attempt);
                    warn!(
                        event_id = %event.event_id,
                        attempt,
                        "projection attempt failed, retrying in {:?}: {}",
                        backoff,
                        err
                    );
                    metrics::counter!(RETRIES_ATTEMPTED).increment(1);
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(err) => {
                    error!(
                        event_id = %event.event_id,
                        product_id = %event.product_id,
                        attempt,
                        "projection failed permanently, dead-lettering: {}",
                        err
                    );
                    return self
                        .dead_letter(payload, key, DeadLetterReason::RetriesExhausted)
                        .await;
                }
            }
        }
    }

    /// One fold-and-persist attempt: read the current aggregate, fold the
    /// event in, write the whole row back. Safe because each partition has
    /// exactly one worker; there is no concurrent writer for this key.
    async fn apply(&self, event: &RatingSubmittedEvent) -> Result<ProductStats, ProjectorError> {
        let current = self.store.get(&event.product_id).await?;
        let next = aggregate::fold(current, event);
        self.store.upsert(&next).await?;
        Ok(next)
    }

    async fn dead_letter(
        &self,
        payload: &[u8],
        key: Option<&[u8]>,
        reason: DeadLetterReason,
    ) -> Result<Outcome, WorkerError> {
        self.dead_letter.send(payload, key).await?;
        metrics::counter!(DEAD_LETTERED).increment(1);
        Ok(Outcome::DeadLettered(reason))
    }
}

/// Pull deliveries off the stream and route each to the worker owning its
/// partition. One lane per worker; a partition always maps to the same lane,
/// so per-partition order survives the fan-out.
pub async fn run_dispatcher(
    consumer: RatingStreamConsumer,
    lanes: Vec<mpsc::Sender<Delivery>>,
    liveness: HealthHandle,
) {
    let mut liveness_interval = tokio::time::interval(Duration::from_secs(10));

    loop {
        tokio::select! {
            _ = liveness_interval.tick() => {
                liveness.report_healthy().await;
            }
            result = consumer.recv() => {
                let delivery = match result {
                    Ok(delivery) => delivery,
                    Err(RecvErr::Empty) => {
                        metrics::counter!(EMPTY_PAYLOADS).increment(1);
                        continue;
                    }
                    Err(RecvErr::Kafka(err)) => {
                        // If Kafka is down, we're down.
                        panic!("Kafka error: {:?}", err);
                    }
                };

                metrics::counter!(EVENTS_RECEIVED).increment(1);

                let lane = delivery.partition.unsigned_abs() as usize % lanes.len();
                if lanes[lane].send(delivery).await.is_err() {
                    error!("worker for lane {} is gone, stopping dispatcher", lane);
                    return;
                }
            }
        }
    }
}

/// Process deliveries for the partitions routed to this worker, strictly in
/// the order received. The offset is stored only after `process` settles the
/// message; a crash in between redelivers it (at-least-once).
pub async fn run_worker<S, D>(
    mut lane: mpsc::Receiver<Delivery>,
    projector: Arc<Projector<S, D>>,
    liveness: HealthHandle,
) where
    S: StatsStore,
    D: DeadLetterSink,
{
    let mut liveness_interval = tokio::time::interval(Duration::from_secs(10));

    loop {
        tokio::select! {
            _ = liveness_interval.tick() => {
                liveness.report_healthy().await;
            }
            maybe_delivery = lane.recv() => {
                let Some(delivery) = maybe_delivery else {
                    info!("lane closed, stopping worker");
                    return;
                };

                let started = Instant::now();
                match projector
                    .process(&delivery.payload, delivery.key.as_deref())
                    .await
                {
                    Ok(_) => {
                        metrics::histogram!(PROJECTION_TIME)
                            .record(started.elapsed().as_secs_f64());
                        if let Err(err) = delivery.ack() {
                            error!("failed to store offset, stopping worker: {}", err);
                            return;
                        }
                    }
                    Err(err) => {
                        // Could not even dead-letter. Leave the offset
                        // unstored so the envelope is redelivered, and stop;
                        // the stalled liveness check will recycle the pod.
                        error!("worker stopping: {}", err);
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use ratings_common::store::StoreError;

    use super::*;
    use crate::dead_letter::DeadLetterError;

    /// In-memory `StatsStore` with per-product failure injection.
    #[derive(Default)]
    struct MemoryStatsStore {
        rows: Mutex<HashMap<String, ProductStats>>,
        failing_products: HashSet<String>,
        /// Fail this many upserts before starting to succeed.
        fail_first_upserts: Mutex<u32>,
        upsert_attempts: Mutex<u32>,
    }

    impl MemoryStatsStore {
        fn failing_for(products: &[&str]) -> Self {
            Self {
                failing_products: products.iter().map(|p| (*p).to_owned()).collect(),
                ..Default::default()
            }
        }

        fn flaky(failures: u32) -> Self {
            Self {
                fail_first_upserts: Mutex::new(failures),
                ..Default::default()
            }
        }

        fn transient_error() -> StoreError {
            StoreError::QueryError {
                command: "INSERT",
                error: sqlx::Error::PoolTimedOut,
            }
        }

        fn row(&self, product_id: &str) -> Option<ProductStats> {
            self.rows.lock().unwrap().get(product_id).cloned()
        }

        fn attempts(&self) -> u32 {
            *self.upsert_attempts.lock().unwrap()
        }
    }

    #[async_trait]
    impl StatsStore for MemoryStatsStore {
        async fn upsert(&self, stats: &ProductStats) -> Result<(), StoreError> {
            *self.upsert_attempts.lock().unwrap() += 1;

            if self.failing_products.contains(&stats.product_id) {
                return Err(Self::transient_error());
            }
            {
                let mut remaining = self.fail_first_upserts.lock().unwrap();
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(Self::transient_error());
                }
            }

            self.rows
                .lock()
                .unwrap()
                .insert(stats.product_id.clone(), stats.clone());
            Ok(())
        }

        async fn get(&self, product_id: &str) -> Result<Option<ProductStats>, StoreError> {
            Ok(self.row(product_id))
        }

        async fn ensure_exists(&self, product_id: &str) -> Result<bool, StoreError> {
            let mut rows = self.rows.lock().unwrap();
            if rows.contains_key(product_id) {
                return Ok(false);
            }
            rows.insert(product_id.to_owned(), ProductStats::empty(product_id));
            Ok(true)
        }
    }

    #[derive(Default)]
    struct RecordingDeadLetter {
        sent: Mutex<Vec<(Vec<u8>, Option<Vec<u8>>)>>,
    }

    impl RecordingDeadLetter {
        fn received(&self) -> Vec<(Vec<u8>, Option<Vec<u8>>)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DeadLetterSink for RecordingDeadLetter {
        async fn send(&self, payload: &[u8], key: Option<&[u8]>) -> Result<(), DeadLetterError> {
            self.sent
                .lock()
                .unwrap()
                .push((payload.to_vec(), key.map(<[u8]>::to_vec)));
            Ok(())
        }
    }

    struct BrokenDeadLetter {}

    #[async_trait]
    impl DeadLetterSink for BrokenDeadLetter {
        async fn send(&self, _: &[u8], _: Option<&[u8]>) -> Result<(), DeadLetterError> {
            Err(DeadLetterError::Canceled)
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, 2, Duration::from_millis(1), None)
    }

    fn projector(
        store: MemoryStatsStore,
    ) -> Projector<Arc<MemoryStatsStore>, Arc<RecordingDeadLetter>> {
        Projector::new(
            Arc::new(store),
            Arc::new(RecordingDeadLetter::default()),
            fast_policy(3),
        )
    }

    fn payload(product_id: &str, rating: u8) -> Vec<u8> {
        let event = RatingSubmittedEvent::new("sub-1", product_id, rating, None);
        serde_json::to_vec(&event).unwrap()
    }

    #[tokio::test]
    async fn applies_a_valid_event() {
        let projector = projector(MemoryStatsStore::default());

        let outcome = projector.process(&payload("X", 5), None).await.unwrap();

        let Outcome::Applied(stats) = outcome else {
            panic!("expected the event to be applied");
        };
        assert_eq!(stats.review_count, 1);
        assert_eq!(stats.average_rating, Some(5.0));
        assert_eq!(projector.store.row("X").unwrap().review_count, 1);
    }

    #[tokio::test]
    async fn folds_accumulate_per_product() {
        let projector = projector(MemoryStatsStore::default());

        projector.process(&payload("X", 5), None).await.unwrap();
        projector.process(&payload("X", 1), None).await.unwrap();

        let stats = projector.store.row("X").unwrap();
        assert_eq!(stats.review_count, 2);
        assert_eq!(stats.average_rating, Some(3.0));
        assert_eq!(stats.rating_distribution.count(1), 1);
        assert_eq!(stats.rating_distribution.count(5), 1);
    }

    #[tokio::test]
    async fn out_of_range_rating_is_dead_lettered_verbatim_and_never_applied() {
        let projector = projector(MemoryStatsStore::default());
        let bytes = payload("X", 6);

        let outcome = projector
            .process(&bytes, Some(b"X".as_slice()))
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            Outcome::DeadLettered(DeadLetterReason::Invalid)
        ));
        assert!(projector.store.row("X").is_none());
        assert_eq!(projector.store.attempts(), 0);

        let received = projector.dead_letter.received();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0, bytes); // byte-for-byte, not re-serialized
        assert_eq!(received[0].1.as_deref(), Some(b"X".as_slice()));
    }

    #[tokio::test]
    async fn malformed_payloads_are_dead_lettered_without_retry() {
        let projector = projector(MemoryStatsStore::default());

        let outcome = projector.process(b"not json at all", None).await.unwrap();

        assert!(matches!(
            outcome,
            Outcome::DeadLettered(DeadLetterReason::Malformed)
        ));
        assert_eq!(projector.store.attempts(), 0);
        assert_eq!(projector.dead_letter.received().len(), 1);
    }

    #[tokio::test]
    async fn transient_store_failures_are_retried_until_success() {
        let projector = projector(MemoryStatsStore::flaky(2));

        let outcome = projector.process(&payload("X", 4), None).await.unwrap();

        assert!(matches!(outcome, Outcome::Applied(_)));
        assert_eq!(projector.store.attempts(), 3); // 2 failures + 1 success
        assert!(projector.dead_letter.received().is_empty());
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter_the_original_envelope() {
        let projector = projector(MemoryStatsStore::failing_for(&["X"]));
        let bytes = payload("X", 4);

        let outcome = projector.process(&bytes, None).await.unwrap();

        assert!(matches!(
            outcome,
            Outcome::DeadLettered(DeadLetterReason::RetriesExhausted)
        ));
        assert_eq!(projector.store.attempts(), 3); // the full attempt ceiling
        assert!(projector.store.row("X").is_none());

        let received = projector.dead_letter.received();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0, bytes);
    }

    #[tokio::test]
    async fn a_poisonous_product_does_not_block_others() {
        let projector = projector(MemoryStatsStore::failing_for(&["A"]));

        let poisoned = projector.process(&payload("A", 2), None).await.unwrap();
        assert!(matches!(poisoned, Outcome::DeadLettered(_)));

        let healthy = projector.process(&payload("B", 5), None).await.unwrap();
        assert!(matches!(healthy, Outcome::Applied(_)));
        assert_eq!(projector.store.row("B").unwrap().review_count, 1);
    }

    #[tokio::test]
    async fn dead_letter_failure_bubbles_up_for_redelivery() {
        let projector = Projector::new(
            Arc::new(MemoryStatsStore::default()),
            BrokenDeadLetter {},
            fast_policy(3),
        );

        let result = projector.process(b"not json at all", None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn reconciliation_creates_an_empty_row_once() {
        let store = Arc::new(MemoryStatsStore::default());

        assert!(store.ensure_exists("X").await.unwrap());
        assert!(!store.ensure_exists("X").await.unwrap());

        let stats = store.row("X").unwrap();
        assert_eq!(stats.review_count, 0);
        assert_eq!(stats.average_rating, None);
        assert_eq!(stats.rating_distribution.total(), 0);
    }

    #[tokio::test]
    async fn reconciliation_never_clobbers_existing_stats() {
        let store = Arc::new(MemoryStatsStore::default());
        let projector = Projector::new(
            store.clone(),
            Arc::new(RecordingDeadLetter::default()),
            fast_policy(3),
        );

        projector.process(&payload("X", 5), None).await.unwrap();
        assert!(!store.ensure_exists("X").await.unwrap());
        assert_eq!(store.row("X").unwrap().review_count, 1);
    }
}
