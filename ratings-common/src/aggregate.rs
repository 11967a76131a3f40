use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::event::{RatingSubmittedEvent, MAX_RATING, MIN_RATING};

/// Per-star review counts, indexed by star level 1..=5.
///
/// Stored as a fixed array so every star level always has a defined count,
/// but serialized as a `{"1": n, ..., "5": n}` map to keep the JSONB column
/// readable by the query side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StarDistribution([u32; 5]);

impl StarDistribution {
    pub fn count(&self, star: u8) -> u32 {
        debug_assert!((MIN_RATING..=MAX_RATING).contains(&star));
        self.0[usize::from(star) - 1]
    }

    pub fn increment(&mut self, star: u8) {
        debug_assert!((MIN_RATING..=MAX_RATING).contains(&star));
        self.0[usize::from(star) - 1] += 1;
    }

    /// Total number of reviews across all star levels.
    pub fn total(&self) -> u64 {
        self.0.iter().map(|&count| u64::from(count)).sum()
    }

    /// Sum of star * count over all star levels.
    pub fn weighted_sum(&self) -> u64 {
        self.0
            .iter()
            .enumerate()
            .map(|(i, &count)| (i as u64 + 1) * u64::from(count))
            .sum()
    }
}

impl Serialize for StarDistribution {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(5))?;
        for (i, count) in self.0.iter().enumerate() {
            map.serialize_entry(&(i + 1).to_string(), count)?;
        }
        map.end()
    }
}

struct StarDistributionVisitor;

impl<'de> Visitor<'de> for StarDistributionVisitor {
    type Value = StarDistribution;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "a map from star level (\"1\"..\"5\") to count")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
        let mut distribution = StarDistribution::default();
        while let Some((key, count)) = access.next_entry::<String, u32>()? {
            let star: u8 = key.parse().map_err(|_| {
                serde::de::Error::invalid_value(serde::de::Unexpected::Str(&key), &self)
            })?;
            if !(MIN_RATING..=MAX_RATING).contains(&star) {
                return Err(serde::de::Error::invalid_value(
                    serde::de::Unexpected::Str(&key),
                    &self,
                ));
            }
            distribution.0[usize::from(star) - 1] = count;
        }
        Ok(distribution)
    }
}

impl<'de> Deserialize<'de> for StarDistribution {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(StarDistributionVisitor)
    }
}

/// The materialized per-product rating statistics row, the only thing the
/// read path ever queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductStats {
    pub product_id: String,
    /// Rounded half-up to two decimals. `None` until the first review lands.
    pub average_rating: Option<f64>,
    pub review_count: i64,
    pub rating_distribution: StarDistribution,
    pub last_updated: DateTime<Utc>,
}

impl ProductStats {
    /// An empty record for a product with no reviews yet. Also what the
    /// reconciliation path inserts when repairing a missing row.
    pub fn empty(product_id: impl Into<String>) -> Self {
        Self {
            product_id: product_id.into(),
            average_rating: None,
            review_count: 0,
            rating_distribution: StarDistribution::default(),
            last_updated: Utc::now(),
        }
    }
}

/// Fold one rating event into the current aggregate, producing the next one.
///
/// This is a pure transformation: it owns no state and performs no I/O. It is
/// deliberately *not* idempotent: folding the same event twice counts it
/// twice. Bounding duplicate application is the projector's job, via its
/// store-then-acknowledge discipline.
///
/// The caller is expected to have validated `event.rating` already; the
/// distribution index would panic on an out-of-range value in debug builds.
pub fn fold(current: Option<ProductStats>, event: &RatingSubmittedEvent) -> ProductStats {
    let mut stats = current.unwrap_or_else(|| ProductStats::empty(&event.product_id));

    stats.rating_distribution.increment(event.rating);
    stats.review_count += 1;
    stats.average_rating = Some(round_half_up(
        stats.rating_distribution.weighted_sum() as f64 / stats.review_count as f64,
    ));
    stats.last_updated = Utc::now();

    stats
}

/// Round to two decimal places, half-up, matching how the query side formats
/// averages. `f64::round` rounds half away from zero, which is half-up for
/// the non-negative values we feed it.
fn round_half_up(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_with_rating(product_id: &str, rating: u8) -> RatingSubmittedEvent {
        RatingSubmittedEvent::new("sub-1", product_id, rating, None)
    }

    fn fold_sequence(product_id: &str, ratings: &[u8]) -> ProductStats {
        ratings.iter().fold(None, |current, &rating| {
            Some(fold(current, &event_with_rating(product_id, rating)))
        })
        .expect("at least one rating folded")
    }

    #[test]
    fn fold_initializes_absent_aggregates() {
        let stats = fold(None, &event_with_rating("product-1", 4));

        assert_eq!(stats.product_id, "product-1");
        assert_eq!(stats.review_count, 1);
        assert_eq!(stats.rating_distribution.count(4), 1);
        assert_eq!(stats.average_rating, Some(4.0));
    }

    #[test]
    fn fold_matches_the_full_recompute() {
        let ratings = [5u8, 3, 4, 1, 5, 5, 2, 3, 4, 4];
        let stats = fold_sequence("product-1", &ratings);

        assert_eq!(stats.review_count, ratings.len() as i64);
        for star in MIN_RATING..=MAX_RATING {
            let expected = ratings.iter().filter(|&&r| r == star).count() as u32;
            assert_eq!(stats.rating_distribution.count(star), expected);
        }

        let mean = ratings.iter().map(|&r| f64::from(r)).sum::<f64>() / ratings.len() as f64;
        assert_eq!(stats.average_rating, Some(round_half_up(mean)));
    }

    #[test]
    fn distribution_total_always_equals_review_count() {
        let mut current = None;
        for rating in [1u8, 5, 3, 3, 2, 4, 5, 1] {
            let next = fold(current, &event_with_rating("product-1", rating));
            assert_eq!(next.rating_distribution.total(), next.review_count as u64);
            current = Some(next);
        }
    }

    #[test]
    fn fold_is_order_insensitive() {
        let forwards = fold_sequence("product-1", &[1, 2, 3, 4, 5, 5, 4]);
        let backwards = fold_sequence("product-1", &[4, 5, 5, 4, 3, 2, 1]);

        assert_eq!(forwards.average_rating, backwards.average_rating);
        assert_eq!(forwards.rating_distribution, backwards.rating_distribution);
        assert_eq!(forwards.review_count, backwards.review_count);
    }

    #[test]
    fn average_rounds_half_up_to_two_decimals() {
        // 5 + 4 + 4 = 13 over 3 reviews: 4.333... rounds down.
        let stats = fold_sequence("product-1", &[5, 4, 4]);
        assert_eq!(stats.average_rating, Some(4.33));

        // 5 + 5 + 4 = 14 over 3: 4.666... rounds up.
        let stats = fold_sequence("product-1", &[5, 5, 4]);
        assert_eq!(stats.average_rating, Some(4.67));

        // 3 + 4 = 7 over 2: exactly 3.5, stays put at two decimals.
        let stats = fold_sequence("product-1", &[3, 4]);
        assert_eq!(stats.average_rating, Some(3.5));
    }

    #[test]
    fn worked_example_from_the_read_path_contract() {
        let stats = fold_sequence("X", &[5, 1]);

        assert_eq!(stats.review_count, 2);
        assert_eq!(stats.rating_distribution.count(1), 1);
        assert_eq!(stats.rating_distribution.count(5), 1);
        for star in [2u8, 3, 4] {
            assert_eq!(stats.rating_distribution.count(star), 0);
        }
        assert_eq!(stats.average_rating, Some(3.0));
    }

    // Documents the known duplicate-counting behavior under at-least-once
    // delivery rather than asserting something we wish were true.
    #[test]
    fn folding_the_same_event_twice_double_counts() {
        let event = event_with_rating("product-1", 5);

        let once = fold(None, &event);
        let twice = fold(Some(once), &event);

        assert_eq!(twice.review_count, 2);
        assert_eq!(twice.rating_distribution.count(5), 2);
    }

    #[test]
    fn empty_record_has_no_average() {
        let stats = ProductStats::empty("product-1");

        assert_eq!(stats.review_count, 0);
        assert_eq!(stats.average_rating, None);
        assert_eq!(stats.rating_distribution.total(), 0);
    }

    #[test]
    fn distribution_serializes_as_a_star_keyed_map() {
        let stats = fold_sequence("product-1", &[5, 5, 1]);
        let json = serde_json::to_value(stats.rating_distribution).unwrap();

        assert_eq!(json["1"], 1);
        assert_eq!(json["2"], 0);
        assert_eq!(json["5"], 2);

        let parsed: StarDistribution = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, stats.rating_distribution);
    }

    #[test]
    fn distribution_tolerates_sparse_maps_from_older_rows() {
        // Rows written before every star level was always materialized.
        let parsed: StarDistribution = serde_json::from_str(r#"{"5": 3, "2": 1}"#).unwrap();

        assert_eq!(parsed.count(5), 3);
        assert_eq!(parsed.count(2), 1);
        assert_eq!(parsed.count(1), 0);
        assert_eq!(parsed.total(), 4);
    }
}
