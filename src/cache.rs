//! Short-TTL memo of selection results.
//!
//! Entries expire purely by TTL. Nothing invalidates an entry when an ad hits
//! its cap mid-TTL, so the TTL bounds how stale a cap decision can be and
//! should stay near a single page render. The cache is never authoritative
//! for cap enforcement.
//!
//! The key leaves out the session, so a reload of the same page within the
//! TTL is a cache hit: a `once_per_page` ad shown on the first load is shown
//! again, and the second load records no impression.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::json;

use crate::error::StoreError;
use crate::model::{Ad, SelectionRequest};
use crate::store::SelectionCache;

/// Build the cache key for a selection request.
///
/// Every input that can change the eligible set is part of the key:
/// slot addressing, page context, device, targeting inputs, exclusions and
/// the limit. The session id is deliberately left out, which lets one
/// computed result serve every session on the page within the TTL.
pub fn fingerprint(request: &SelectionRequest) -> String {
    let mut exclude_collections = request.exclude_collection_ids.clone();
    exclude_collections.sort();
    exclude_collections.dedup();
    let mut exclude_ads = request.exclude_ad_ids.clone();
    exclude_ads.sort();
    exclude_ads.dedup();

    let key = json!({
        "placement": request.placement,
        "pageType": request.page_type,
        "device": request.device,
        "sectionIndex": request.section_index,
        "paragraphIndex": request.paragraph_index,
        "placementId": request.placement_id,
        "adId": request.ad_id,
        "categoryId": request.category_id,
        "articleId": request.article_id,
        "pageUrl": request.page_url,
        "limit": request.limit,
        "isLoggedIn": request.is_logged_in,
        "country": request.country,
        "excludeCollectionIds": exclude_collections,
        "excludeAdIds": exclude_ads,
    });

    format!("select:{key}")
}

struct CacheEntry {
    ads: Vec<Ad>,
    expires_at: Instant,
}

/// In-process selection cache backed by DashMap.
#[derive(Clone)]
pub struct LocalSelectionCache {
    store: Arc<DashMap<String, CacheEntry>>,
    max_entries: usize,
}

impl LocalSelectionCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            store: Arc::new(DashMap::with_capacity(max_entries.min(4096))),
            max_entries,
        }
    }

    /// Remove expired entries. Call this periodically from a background task.
    pub fn evict_expired(&self) -> usize {
        let before = self.store.len();
        let now = Instant::now();
        self.store.retain(|_, entry| entry.expires_at > now);
        before - self.store.len()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

#[async_trait]
impl SelectionCache for LocalSelectionCache {
    async fn get(&self, fingerprint: &str) -> Result<Option<Vec<Ad>>, StoreError> {
        let Some(entry) = self.store.get(fingerprint) else {
            return Ok(None);
        };
        if entry.expires_at <= Instant::now() {
            drop(entry);
            self.store.remove(fingerprint);
            return Ok(None);
        }
        Ok(Some(entry.ads.clone()))
    }

    async fn set(&self, fingerprint: &str, ads: Vec<Ad>, ttl: Duration) -> Result<(), StoreError> {
        // Over capacity: skip the insert, the sweeper makes room
        if self.store.len() >= self.max_entries && !self.store.contains_key(fingerprint) {
            return Ok(());
        }
        self.store.insert(
            fingerprint.to_string(),
            CacheEntry {
                ads,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }
}
