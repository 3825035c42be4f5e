pub mod bitable;

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;

use crate::types::{PoolKey, PoolRecord, Rating, Topic};

/// Records ingested within this window of the newest one form a batch.
pub const BATCH_WINDOW_MS: i64 = 2 * 60 * 1000;
pub const BATCH_LIMIT: usize = 50;

/// Field updates for one existing record. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Annotation {
    pub record_id: String,
    pub rating: Option<Rating>,
    pub reason: Option<String>,
    pub quote: Option<String>,
    pub wordplay: Option<String>,
    pub script: Option<String>,
    pub estimated_duration: Option<String>,
}

impl Annotation {
    /// Low-fit topics only get their rating written.
    pub fn for_rated(record_id: impl Into<String>, topic: &Topic) -> Self {
        let record_id = record_id.into();
        match topic.rating {
            Some(Rating::Low) | None => Self {
                record_id,
                rating: Some(Rating::Low),
                ..Self::default()
            },
            Some(rating) => Self {
                record_id,
                rating: Some(rating),
                reason: Some(topic.reason.clone().unwrap_or_default()),
                quote: Some(topic.quote.clone().unwrap_or_default()),
                wordplay: Some(String::new()),
                ..Self::default()
            },
        }
    }

    pub fn for_script(record_id: impl Into<String>, script: &str, duration: &str) -> Self {
        Self {
            record_id: record_id.into(),
            script: Some(script.to_string()),
            estimated_duration: Some(duration.to_string()),
            ..Self::default()
        }
    }
}

/// The tabular store holding per-platform hot-search tables and the topic pool.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Unrated topics of the most recent ingestion batch in `table_id`.
    async fn fetch_latest_unscored_batch(&self, table_id: &str) -> Result<Vec<Topic>>;
    async fn batch_annotate(&self, table_id: &str, annotations: &[Annotation]) -> Result<usize>;
    async fn fetch_pool_membership_keys(&self) -> Result<HashSet<PoolKey>>;
    /// Returns the number of records the store inserted.
    async fn append_to_pool(&self, records: &[PoolRecord]) -> Result<usize>;
    async fn fetch_human_confirmed_topics(&self) -> Result<Vec<Topic>>;
    async fn annotate_pool(&self, annotations: &[Annotation]) -> Result<usize>;
}

/// Keeps the newest ingestion batch: records within `BATCH_WINDOW_MS` of the
/// newest timestamp, newest first, at most `BATCH_LIMIT`.
pub fn latest_batch(mut records: Vec<Topic>) -> Vec<Topic> {
    records.sort_by(|a, b| b.fetched_at.cmp(&a.fetched_at));
    if let Some(newest) = records.first().and_then(|t| t.fetched_at) {
        let cutoff = newest - BATCH_WINDOW_MS;
        records.retain(|t| t.fetched_at.is_some_and(|at| at >= cutoff));
    }
    records.truncate(BATCH_LIMIT);
    records
}
