use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;

use crate::aggregate::{ProductStats, StarDistribution};

/// Enumeration of errors for operations on the stats store.
/// Errors can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError {
        command: &'static str,
        error: sqlx::Error,
    },
}

/// The keyed materialized view of per-product rating statistics.
///
/// The projector is the only writer; the read path only ever calls `get` and
/// treats `None` as "no ratings yet". A trait so the projector's control
/// flow can be exercised against an in-memory stand-in.
#[async_trait]
pub trait StatsStore {
    /// Replace the whole row for `stats.product_id`, atomically. Last writer
    /// wins; partial writes of individual columns must be impossible.
    async fn upsert(&self, stats: &ProductStats) -> Result<(), StoreError>;

    /// Fetch the current aggregate, if the product has one.
    async fn get(&self, product_id: &str) -> Result<Option<ProductStats>, StoreError>;

    /// Reconciliation hook: make sure a row exists for `product_id`,
    /// inserting an empty one if needed. Returns whether a row was created.
    /// This is repair/backfill plumbing, not a recount of raw reviews.
    async fn ensure_exists(&self, product_id: &str) -> Result<bool, StoreError>;
}

// Workers share one store handle; delegate through `Arc` so they can.
#[async_trait]
impl<S: StatsStore + Send + Sync> StatsStore for std::sync::Arc<S> {
    async fn upsert(&self, stats: &ProductStats) -> Result<(), StoreError> {
        self.as_ref().upsert(stats).await
    }

    async fn get(&self, product_id: &str) -> Result<Option<ProductStats>, StoreError> {
        self.as_ref().get(product_id).await
    }

    async fn ensure_exists(&self, product_id: &str) -> Result<bool, StoreError> {
        self.as_ref().ensure_exists(product_id).await
    }
}

#[derive(sqlx::FromRow)]
struct ProductStatsRow {
    product_id: String,
    average_rating: Option<f64>,
    review_count: i64,
    rating_distribution: sqlx::types::Json<StarDistribution>,
    last_updated: DateTime<Utc>,
}

impl From<ProductStatsRow> for ProductStats {
    fn from(row: ProductStatsRow) -> Self {
        ProductStats {
            product_id: row.product_id,
            average_rating: row.average_rating,
            review_count: row.review_count,
            rating_distribution: row.rating_distribution.0,
            last_updated: row.last_updated,
        }
    }
}

/// `StatsStore` backed by the `product_stats` table in PostgreSQL.
#[derive(Clone)]
pub struct PgStatsStore {
    pool: PgPool,
}

impl PgStatsStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl StatsStore for PgStatsStore {
    async fn upsert(&self, stats: &ProductStats) -> Result<(), StoreError> {
        sqlx::query(
            r#"
INSERT INTO product_stats
    (product_id, average_rating, review_count, rating_distribution, last_updated)
VALUES
    ($1, $2, $3, $4, $5)
ON CONFLICT (product_id) DO UPDATE SET
    average_rating = EXCLUDED.average_rating,
    review_count = EXCLUDED.review_count,
    rating_distribution = EXCLUDED.rating_distribution,
    last_updated = EXCLUDED.last_updated
            "#,
        )
        .bind(&stats.product_id)
        .bind(stats.average_rating)
        .bind(stats.review_count)
        .bind(sqlx::types::Json(&stats.rating_distribution))
        .bind(stats.last_updated)
        .execute(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "INSERT",
            error,
        })?;

        Ok(())
    }

    async fn get(&self, product_id: &str) -> Result<Option<ProductStats>, StoreError> {
        let row: Option<ProductStatsRow> = sqlx::query_as(
            r#"
SELECT
    product_id, average_rating, review_count, rating_distribution, last_updated
FROM
    product_stats
WHERE
    product_id = $1
            "#,
        )
        .bind(product_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "SELECT",
            error,
        })?;

        Ok(row.map(ProductStats::from))
    }

    async fn ensure_exists(&self, product_id: &str) -> Result<bool, StoreError> {
        let empty = ProductStats::empty(product_id);

        let result = sqlx::query(
            r#"
INSERT INTO product_stats
    (product_id, average_rating, review_count, rating_distribution, last_updated)
VALUES
    ($1, NULL, 0, $2, $3)
ON CONFLICT (product_id) DO NOTHING
            "#,
        )
        .bind(&empty.product_id)
        .bind(sqlx::types::Json(&empty.rating_distribution))
        .bind(empty.last_updated)
        .execute(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "INSERT",
            error,
        })?;

        Ok(result.rows_affected() > 0)
    }
}
