//! Seams between the selection core and its storage collaborators.
//!
//! The orchestrator, recorder and frequency engine only ever see these
//! traits, injected as `Arc<dyn ...>`. [`crate::storage::Storage`] implements
//! the event store and candidate repository over SQLite, and
//! [`crate::cache::LocalSelectionCache`] implements the selection cache.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::model::{Ad, AdEvent, CandidateCriteria, EventCounts, EventType};

/// Append-only log of delivery events.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist an event. Returns `false` without writing when an event with
    /// the same `event_id` already exists. The check and the insert are one
    /// atomic operation.
    async fn record(&self, event: &AdEvent) -> Result<bool, StoreError>;

    /// Number of events of one type for an ad, optionally since a cutoff.
    async fn count_since(
        &self,
        ad_id: &str,
        event_type: EventType,
        since: Option<DateTime<Utc>>,
    ) -> Result<i64, StoreError>;

    /// Grouped impression/click counts for a batch of ads. Ads without any
    /// events may be missing from the map.
    async fn counts_for_ads(
        &self,
        ad_ids: &[String],
        since: Option<DateTime<Utc>>,
    ) -> Result<HashMap<String, EventCounts>, StoreError>;

    /// The subset of `ad_ids` that already have an event of `event_type`
    /// for the session on the given page. One round-trip per call.
    async fn shown_on_page(
        &self,
        ad_ids: &[String],
        session_id: &str,
        page_key: &str,
        event_type: EventType,
    ) -> Result<HashSet<String>, StoreError>;

    /// Whether this ad already has an event of `event_type` for the session
    /// on the given page.
    async fn exists_for_page(
        &self,
        ad_id: &str,
        session_id: &str,
        page_key: &str,
        event_type: EventType,
    ) -> Result<bool, StoreError> {
        let ids = [ad_id.to_string()];
        let shown = self
            .shown_on_page(&ids, session_id, page_key, event_type)
            .await?;
        Ok(shown.contains(ad_id))
    }
}

/// Source of targeted ad candidates.
#[async_trait]
pub trait CandidateRepository: Send + Sync {
    /// Active, live ads matching placement and targeting, ordered by
    /// `(priority desc, order asc)`, at most `limit` of them.
    async fn find_candidates(
        &self,
        criteria: &CandidateCriteria,
        limit: usize,
    ) -> Result<Vec<Ad>, StoreError>;

    async fn find_ad(&self, ad_id: &str) -> Result<Option<Ad>, StoreError>;
}

/// Short-lived memo of selection results keyed by request fingerprint.
#[async_trait]
pub trait SelectionCache: Send + Sync {
    async fn get(&self, fingerprint: &str) -> Result<Option<Vec<Ad>>, StoreError>;

    async fn set(&self, fingerprint: &str, ads: Vec<Ad>, ttl: Duration) -> Result<(), StoreError>;
}

/// Run a dependency call under a deadline, mapping expiry to
/// [`StoreError::Timeout`].
pub async fn with_timeout<T, F>(
    operation: &'static str,
    limit: Duration,
    call: F,
) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(operation)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_timeout_passes_result_through() {
        let value = with_timeout("op", Duration::from_secs(1), async { Ok::<_, StoreError>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_with_timeout_expires() {
        let result = with_timeout("slow op", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, StoreError>(())
        })
        .await;

        assert!(matches!(result, Err(StoreError::Timeout("slow op"))));
    }
}
