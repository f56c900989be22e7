//! SQLite storage layer for adselect.
//!
//! Implements both the [`EventStore`] and the [`CandidateRepository`] over a
//! single connection pool. Schema:
//!
//! - `ad_collections`: targeting envelopes, target lists stored as JSON text
//! - `ads`: creatives, frequency rule stored as JSON text
//! - `ad_events`: append-only impressions and clicks, unique on `event_id`
//! - `ad_counters`: lifetime per-ad totals, bumped in the same transaction
//!   as each new event
//!
//! Timestamps are Unix seconds.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::TryStreamExt;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::info;

use crate::error::StoreError;
use crate::model::{
    Ad, AdCollection, AdEvent, AdStatus, CandidateCriteria, EventCounts, EventType, Inventory,
    Placement,
};
use crate::store::{CandidateRepository, EventStore};

const AD_COLUMNS: &str = r#"
    a.id, a.collection_id, a.placement, a.title, a.image_url, a.link_url,
    a.priority, a.sort_order, a.status, a.frequency
"#;

const COLLECTION_COLUMNS: &str = r#"
    c.id AS c_id, c.name AS c_name, c.placement AS c_placement,
    c.section_index AS c_section_index, c.paragraph_index AS c_paragraph_index,
    c.placement_id AS c_placement_id, c.target_pages AS c_target_pages,
    c.target_devices AS c_target_devices, c.target_user_types AS c_target_user_types,
    c.target_countries AS c_target_countries, c.target_categories AS c_target_categories,
    c.popup_settings AS c_popup_settings, c.is_active AS c_is_active,
    c.starts_at AS c_starts_at, c.ends_at AS c_ends_at
"#;

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Create a new storage instance and initialize the schema.
    ///
    /// # Arguments
    ///
    /// * `database_url` - SQLite connection string (e.g., "sqlite:adselect.db" or "sqlite::memory:")
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        // An in-memory database lives and dies with its connections; pin it to one.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        let storage = Self { pool };
        storage.initialize_schema().await?;

        Ok(storage)
    }

    /// Create the database schema if it doesn't exist.
    async fn initialize_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ad_collections (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                placement TEXT NOT NULL,
                section_index INTEGER,
                paragraph_index INTEGER,
                placement_id TEXT,
                target_pages TEXT NOT NULL,
                target_devices TEXT NOT NULL,
                target_user_types TEXT NOT NULL,
                target_countries TEXT NOT NULL,
                target_categories TEXT NOT NULL,
                popup_settings TEXT,
                is_active INTEGER NOT NULL,
                starts_at INTEGER,
                ends_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ads (
                id TEXT PRIMARY KEY,
                collection_id TEXT NOT NULL,
                placement TEXT NOT NULL,
                title TEXT NOT NULL,
                image_url TEXT,
                link_url TEXT,
                priority INTEGER NOT NULL,
                sort_order INTEGER NOT NULL,
                status TEXT NOT NULL,
                frequency TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_ads_placement_status
            ON ads(placement, status, priority DESC, sort_order)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ad_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_id TEXT,
                ad_id TEXT NOT NULL,
                session_id TEXT,
                event_type TEXT NOT NULL,
                page_type TEXT NOT NULL,
                page_url TEXT NOT NULL,
                page_key TEXT NOT NULL,
                device TEXT NOT NULL,
                placement TEXT,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // NULL event ids never collide, so only keyed events dedupe
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_ad_events_event_id
            ON ad_events(event_id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_ad_events_page
            ON ad_events(session_id, page_key, ad_id, event_type)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_ad_events_ad_type_ts
            ON ad_events(ad_id, event_type, created_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ad_counters (
                ad_id TEXT PRIMARY KEY,
                impressions INTEGER NOT NULL DEFAULT 0,
                clicks INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert or replace a collection.
    pub async fn save_collection(&self, collection: &AdCollection) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO ad_collections (
                id, name, placement, section_index, paragraph_index, placement_id,
                target_pages, target_devices, target_user_types, target_countries,
                target_categories, popup_settings, is_active, starts_at, ends_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&collection.id)
        .bind(&collection.name)
        .bind(collection.placement.as_str())
        .bind(collection.section_index)
        .bind(collection.paragraph_index)
        .bind(&collection.placement_id)
        .bind(serde_json::to_string(&collection.target_pages)?)
        .bind(serde_json::to_string(&collection.target_devices)?)
        .bind(serde_json::to_string(&collection.target_user_types)?)
        .bind(serde_json::to_string(&collection.target_countries)?)
        .bind(serde_json::to_string(&collection.target_categories)?)
        .bind(
            collection
                .popup_settings
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(collection.is_active)
        .bind(collection.starts_at.map(|t| t.timestamp()))
        .bind(collection.ends_at.map(|t| t.timestamp()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert or replace an ad. Delivery counters are left untouched.
    pub async fn save_ad(&self, ad: &Ad) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO ads (
                id, collection_id, placement, title, image_url, link_url,
                priority, sort_order, status, frequency
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&ad.id)
        .bind(&ad.collection_id)
        .bind(ad.placement.as_str())
        .bind(&ad.title)
        .bind(&ad.image_url)
        .bind(&ad.link_url)
        .bind(ad.priority)
        .bind(ad.order)
        .bind(ad.status.as_str())
        .bind(serde_json::to_string(&ad.frequency)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Load a JSON inventory file (`{"collections": [...], "ads": [...]}`).
    ///
    /// # Returns
    ///
    /// The number of collections and ads written.
    pub async fn load_inventory(&self, path: &Path) -> anyhow::Result<(usize, usize)> {
        let raw = tokio::fs::read_to_string(path).await?;
        let inventory: Inventory = serde_json::from_str(&raw)?;

        for collection in &inventory.collections {
            self.save_collection(collection).await?;
        }
        for ad in &inventory.ads {
            self.save_ad(ad).await?;
        }

        info!(
            path = %path.display(),
            collections = inventory.collections.len(),
            ads = inventory.ads.len(),
            "Inventory loaded"
        );

        Ok((inventory.collections.len(), inventory.ads.len()))
    }
}

#[async_trait]
impl EventStore for Storage {
    async fn record(&self, event: &AdEvent) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO ad_events (
                event_id, ad_id, session_id, event_type, page_type, page_url,
                page_key, device, placement, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&event.event_id)
        .bind(&event.ad_id)
        .bind(&event.session_id)
        .bind(event.event_type.as_str())
        .bind(&event.page_type)
        .bind(&event.page_url)
        .bind(&event.page_key)
        .bind(&event.device)
        .bind(event.placement.map(|p| p.as_str()))
        .bind(event.created_at.timestamp())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        let bump = match event.event_type {
            EventType::Impression => {
                r#"
                INSERT INTO ad_counters (ad_id, impressions, clicks) VALUES (?, 1, 0)
                ON CONFLICT(ad_id) DO UPDATE SET impressions = impressions + 1
                "#
            }
            EventType::Click => {
                r#"
                INSERT INTO ad_counters (ad_id, impressions, clicks) VALUES (?, 0, 1)
                ON CONFLICT(ad_id) DO UPDATE SET clicks = clicks + 1
                "#
            }
        };
        sqlx::query(bump)
            .bind(&event.ad_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn count_since(
        &self,
        ad_id: &str,
        event_type: EventType,
        since: Option<DateTime<Utc>>,
    ) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total
            FROM ad_events
            WHERE ad_id = ? AND event_type = ? AND created_at >= ?
            "#,
        )
        .bind(ad_id)
        .bind(event_type.as_str())
        .bind(since.map_or(i64::MIN, |t| t.timestamp()))
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("total"))
    }

    async fn counts_for_ads(
        &self,
        ad_ids: &[String],
        since: Option<DateTime<Utc>>,
    ) -> Result<HashMap<String, EventCounts>, StoreError> {
        let mut counts: HashMap<String, EventCounts> = HashMap::new();
        if ad_ids.is_empty() {
            return Ok(counts);
        }

        match since {
            // Lifetime totals are maintained incrementally by `record`
            None => {
                let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
                    "SELECT ad_id, impressions, clicks FROM ad_counters WHERE ad_id IN (",
                );
                let mut ids = query.separated(", ");
                for id in ad_ids {
                    ids.push_bind(id.as_str());
                }
                ids.push_unseparated(")");

                for row in query.build().fetch_all(&self.pool).await? {
                    counts.insert(
                        row.get("ad_id"),
                        EventCounts {
                            impressions: row.get("impressions"),
                            clicks: row.get("clicks"),
                        },
                    );
                }
            }
            Some(since) => {
                let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
                    "SELECT ad_id, event_type, COUNT(*) AS total FROM ad_events WHERE created_at >= ",
                );
                query.push_bind(since.timestamp());
                query.push(" AND ad_id IN (");
                let mut ids = query.separated(", ");
                for id in ad_ids {
                    ids.push_bind(id.as_str());
                }
                ids.push_unseparated(") GROUP BY ad_id, event_type");

                for row in query.build().fetch_all(&self.pool).await? {
                    let entry: &mut EventCounts = counts.entry(row.get("ad_id")).or_default();
                    let total: i64 = row.get("total");
                    match row.get::<String, _>("event_type").as_str() {
                        "impression" => entry.impressions = total,
                        "click" => entry.clicks = total,
                        other => {
                            return Err(StoreError::Corrupt(format!("event type {other}")));
                        }
                    }
                }
            }
        }

        Ok(counts)
    }

    async fn shown_on_page(
        &self,
        ad_ids: &[String],
        session_id: &str,
        page_key: &str,
        event_type: EventType,
    ) -> Result<HashSet<String>, StoreError> {
        if ad_ids.is_empty() {
            return Ok(HashSet::new());
        }

        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT DISTINCT ad_id FROM ad_events WHERE session_id = ");
        query.push_bind(session_id);
        query.push(" AND page_key = ");
        query.push_bind(page_key);
        query.push(" AND event_type = ");
        query.push_bind(event_type.as_str());
        query.push(" AND ad_id IN (");
        let mut ids = query.separated(", ");
        for id in ad_ids {
            ids.push_bind(id.as_str());
        }
        ids.push_unseparated(")");

        let rows = query.build().fetch_all(&self.pool).await?;
        Ok(rows.iter().map(|row| row.get("ad_id")).collect())
    }
}

#[async_trait]
impl CandidateRepository for Storage {
    async fn find_candidates(
        &self,
        criteria: &CandidateCriteria,
        limit: usize,
    ) -> Result<Vec<Ad>, StoreError> {
        // Schedule and slot addressing are filtered in SQL; the list-valued
        // targeting columns are matched per row below.
        let sql = format!(
            r#"
            SELECT {AD_COLUMNS}, {COLLECTION_COLUMNS}
            FROM ads a
            JOIN ad_collections c ON c.id = a.collection_id
            WHERE a.status = 'active'
              AND a.placement = ?
              AND c.placement = ?
              AND c.is_active = 1
              AND (c.starts_at IS NULL OR c.starts_at <= ?)
              AND (c.ends_at IS NULL OR c.ends_at > ?)
              AND (c.section_index IS NULL OR ? IS NULL OR c.section_index = ?)
              AND (c.paragraph_index IS NULL OR ? IS NULL OR c.paragraph_index = ?)
              AND (? IS NULL OR a.id = ?)
            ORDER BY a.priority DESC, a.sort_order ASC, a.rowid ASC
            "#
        );

        let now = Utc::now();
        let mut rows = sqlx::query(&sql)
            .bind(criteria.placement.as_str())
            .bind(criteria.placement.as_str())
            .bind(now.timestamp())
            .bind(now.timestamp())
            .bind(criteria.context.section_index)
            .bind(criteria.context.section_index)
            .bind(criteria.paragraph_index)
            .bind(criteria.paragraph_index)
            .bind(&criteria.ad_id)
            .bind(&criteria.ad_id)
            .fetch(&self.pool);

        let mut candidates = Vec::new();
        while candidates.len() < limit {
            let Some(row) = rows.try_next().await? else {
                break;
            };
            let collection = collection_from_row(&row)?;
            if !collection.is_live(now)
                || !collection.matches_slot(criteria)
                || !collection.matches_context(&criteria.context)
            {
                continue;
            }

            let mut ad = ad_from_row(&row)?;
            ad.popup_settings = collection.popup_settings;
            candidates.push(ad);
        }

        Ok(candidates)
    }

    async fn find_ad(&self, ad_id: &str) -> Result<Option<Ad>, StoreError> {
        let sql = format!("SELECT {AD_COLUMNS} FROM ads a WHERE a.id = ?");
        let row = sqlx::query(&sql)
            .bind(ad_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(ad_from_row).transpose()
    }
}

fn parse_placement(value: &str) -> Result<Placement, StoreError> {
    Placement::parse(value).ok_or_else(|| StoreError::Corrupt(format!("placement {value}")))
}

fn timestamp(value: Option<i64>) -> Option<DateTime<Utc>> {
    value.and_then(|ts| Utc.timestamp_opt(ts, 0).single())
}

fn ad_from_row(row: &SqliteRow) -> Result<Ad, StoreError> {
    let status: String = row.get("status");
    let frequency: String = row.get("frequency");

    Ok(Ad {
        id: row.get("id"),
        collection_id: row.get("collection_id"),
        placement: parse_placement(&row.get::<String, _>("placement"))?,
        title: row.get("title"),
        image_url: row.get("image_url"),
        link_url: row.get("link_url"),
        priority: row.get("priority"),
        order: row.get("sort_order"),
        status: AdStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("status {status}")))?,
        frequency: serde_json::from_str(&frequency)?,
        popup_settings: None,
    })
}

fn collection_from_row(row: &SqliteRow) -> Result<AdCollection, StoreError> {
    let list = |column: &str| -> Result<Vec<String>, StoreError> {
        Ok(serde_json::from_str(&row.get::<String, _>(column))?)
    };
    let popup: Option<String> = row.get("c_popup_settings");

    Ok(AdCollection {
        id: row.get("c_id"),
        name: row.get("c_name"),
        placement: parse_placement(&row.get::<String, _>("c_placement"))?,
        section_index: row.get("c_section_index"),
        paragraph_index: row.get("c_paragraph_index"),
        placement_id: row.get("c_placement_id"),
        target_pages: list("c_target_pages")?,
        target_devices: list("c_target_devices")?,
        target_user_types: list("c_target_user_types")?,
        target_countries: list("c_target_countries")?,
        target_categories: list("c_target_categories")?,
        popup_settings: popup.as_deref().map(serde_json::from_str).transpose()?,
        is_active: row.get("c_is_active"),
        starts_at: timestamp(row.get("c_starts_at")),
        ends_at: timestamp(row.get("c_ends_at")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FrequencyRule, TargetingContext, page_key};

    fn collection(id: &str, placement: Placement) -> AdCollection {
        AdCollection {
            id: id.to_string(),
            name: format!("collection {id}"),
            placement,
            section_index: None,
            paragraph_index: None,
            placement_id: None,
            target_pages: vec!["all".to_string()],
            target_devices: vec!["all".to_string()],
            target_user_types: vec!["all".to_string()],
            target_countries: vec!["all".to_string()],
            target_categories: vec!["all".to_string()],
            popup_settings: None,
            is_active: true,
            starts_at: None,
            ends_at: None,
        }
    }

    fn ad(id: &str, collection_id: &str, priority: i32, order: i32) -> Ad {
        Ad {
            id: id.to_string(),
            collection_id: collection_id.to_string(),
            placement: Placement::Sidebar,
            title: format!("ad {id}"),
            image_url: None,
            link_url: Some("https://example.com".to_string()),
            priority,
            order,
            status: AdStatus::Active,
            frequency: FrequencyRule::UNCAPPED,
            popup_settings: None,
        }
    }

    fn event(ad_id: &str, event_type: EventType, event_id: Option<&str>) -> AdEvent {
        AdEvent {
            ad_id: ad_id.to_string(),
            session_id: Some("s1".to_string()),
            event_type,
            page_type: "article".to_string(),
            page_url: "/a".to_string(),
            page_key: page_key("article", "/a"),
            device: "desktop".to_string(),
            placement: Some(Placement::Sidebar),
            created_at: Utc::now(),
            event_id: event_id.map(str::to_string),
        }
    }

    fn sidebar_criteria() -> CandidateCriteria {
        CandidateCriteria {
            placement: Placement::Sidebar,
            paragraph_index: None,
            placement_id: None,
            ad_id: None,
            article_id: None,
            context: TargetingContext {
                page_type: "article".to_string(),
                device: "desktop".to_string(),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_record_dedupes_on_event_id() {
        let storage = Storage::new("sqlite::memory:").await.unwrap();

        let click = event("x", EventType::Click, Some("x:1000:/p"));
        assert!(storage.record(&click).await.unwrap());
        assert!(!storage.record(&click).await.unwrap());

        let total = storage
            .count_since("x", EventType::Click, None)
            .await
            .unwrap();
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn test_events_without_event_id_never_dedupe() {
        let storage = Storage::new("sqlite::memory:").await.unwrap();

        for _ in 0..3 {
            assert!(
                storage
                    .record(&event("x", EventType::Impression, None))
                    .await
                    .unwrap()
            );
        }

        let total = storage
            .count_since("x", EventType::Impression, None)
            .await
            .unwrap();
        assert_eq!(total, 3);
    }

    #[tokio::test]
    async fn test_counters_follow_recorded_events() {
        let storage = Storage::new("sqlite::memory:").await.unwrap();

        storage
            .record(&event("x", EventType::Impression, None))
            .await
            .unwrap();
        storage
            .record(&event("x", EventType::Impression, None))
            .await
            .unwrap();
        storage
            .record(&event("x", EventType::Click, Some("k1")))
            .await
            .unwrap();
        // Duplicate must not bump the counter
        storage
            .record(&event("x", EventType::Click, Some("k1")))
            .await
            .unwrap();

        let ids = vec!["x".to_string(), "never-shown".to_string()];
        let lifetime = storage.counts_for_ads(&ids, None).await.unwrap();
        assert_eq!(
            lifetime["x"],
            EventCounts {
                impressions: 2,
                clicks: 1
            }
        );
        assert!(!lifetime.contains_key("never-shown"));

        let windowed = storage
            .counts_for_ads(&ids, Some(Utc::now() - chrono::Duration::hours(1)))
            .await
            .unwrap();
        assert_eq!(windowed["x"], lifetime["x"]);
    }

    #[tokio::test]
    async fn test_windowed_counts_skip_old_events() {
        let storage = Storage::new("sqlite::memory:").await.unwrap();

        let mut old = event("x", EventType::Impression, None);
        old.created_at = Utc::now() - chrono::Duration::hours(2);
        storage.record(&old).await.unwrap();
        storage
            .record(&event("x", EventType::Impression, None))
            .await
            .unwrap();

        let since = Utc::now() - chrono::Duration::hours(1);
        let counts = storage
            .counts_for_ads(&["x".to_string()], Some(since))
            .await
            .unwrap();
        assert_eq!(counts["x"].impressions, 1);

        let total = storage
            .count_since("x", EventType::Impression, Some(since))
            .await
            .unwrap();
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn test_exists_for_page_is_page_scoped() {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        storage
            .record(&event("b", EventType::Impression, None))
            .await
            .unwrap();

        let shown = |page: &'static str| {
            let storage = storage.clone();
            async move {
                storage
                    .exists_for_page("b", "s1", page, EventType::Impression)
                    .await
                    .unwrap()
            }
        };

        assert!(shown("article:/a").await);
        assert!(!shown("article:/b").await);
        assert!(
            !storage
                .exists_for_page("b", "s2", "article:/a", EventType::Impression)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_shown_on_page_checks_a_batch_in_one_call() {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        for id in ["a", "c"] {
            storage
                .record(&event(id, EventType::Impression, None))
                .await
                .unwrap();
        }
        storage
            .record(&event("b", EventType::Click, None))
            .await
            .unwrap();

        let ids = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let shown = storage
            .shown_on_page(&ids, "s1", "article:/a", EventType::Impression)
            .await
            .unwrap();
        assert_eq!(shown, HashSet::from(["a".to_string(), "c".to_string()]));

        let elsewhere = storage
            .shown_on_page(&ids, "s1", "article:/b", EventType::Impression)
            .await
            .unwrap();
        assert!(elsewhere.is_empty());
        assert!(
            storage
                .shown_on_page(&[], "s1", "article:/a", EventType::Impression)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_find_candidates_skips_inactive_and_unscheduled_collections() {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        let now = Utc::now();

        let mut inactive = collection("inactive", Placement::Sidebar);
        inactive.is_active = false;
        let mut ended = collection("ended", Placement::Sidebar);
        ended.ends_at = Some(now - chrono::Duration::hours(1));
        let mut upcoming = collection("upcoming", Placement::Sidebar);
        upcoming.starts_at = Some(now + chrono::Duration::hours(1));
        let mut running = collection("running", Placement::Sidebar);
        running.starts_at = Some(now - chrono::Duration::hours(1));
        running.ends_at = Some(now + chrono::Duration::hours(1));

        for (i, c) in [inactive, ended, upcoming, running].iter().enumerate() {
            storage.save_collection(c).await.unwrap();
            storage
                .save_ad(&ad(&format!("ad-{}", c.id), &c.id, 10 - i as i32, 0))
                .await
                .unwrap();
        }

        let found = storage
            .find_candidates(&sidebar_criteria(), 10)
            .await
            .unwrap();
        let ids: Vec<_> = found.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["ad-running"]);
    }

    #[tokio::test]
    async fn test_find_candidates_fills_limit_past_untargeted_rows() {
        let storage = Storage::new("sqlite::memory:").await.unwrap();

        let mut mobile_only = collection("mobile", Placement::Sidebar);
        mobile_only.target_devices = vec!["mobile".to_string()];
        storage.save_collection(&mobile_only).await.unwrap();
        storage
            .save_collection(&collection("open", Placement::Sidebar))
            .await
            .unwrap();

        // Higher-priority rows that the desktop request must read past
        for i in 0..20 {
            storage
                .save_ad(&ad(&format!("m{i}"), "mobile", 100, i))
                .await
                .unwrap();
        }
        for i in 0..20 {
            storage
                .save_ad(&ad(&format!("o{i}"), "open", 1, i))
                .await
                .unwrap();
        }

        let found = storage
            .find_candidates(&sidebar_criteria(), 3)
            .await
            .unwrap();
        let ids: Vec<_> = found.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["o0", "o1", "o2"]);
    }

    #[tokio::test]
    async fn test_find_candidates_section_index() {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        let mut second = collection("second", Placement::BetweenSections);
        second.section_index = Some(2);
        storage.save_collection(&second).await.unwrap();
        let mut a = ad("s2", "second", 1, 0);
        a.placement = Placement::BetweenSections;
        storage.save_ad(&a).await.unwrap();

        let mut criteria = sidebar_criteria();
        criteria.placement = Placement::BetweenSections;
        criteria.context.section_index = Some(3);
        assert!(storage.find_candidates(&criteria, 5).await.unwrap().is_empty());

        criteria.context.section_index = Some(2);
        assert_eq!(storage.find_candidates(&criteria, 5).await.unwrap().len(), 1);

        criteria.context.section_index = None;
        assert_eq!(storage.find_candidates(&criteria, 5).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_find_candidates_orders_and_filters() {
        let storage = Storage::new("sqlite::memory:").await.unwrap();

        storage
            .save_collection(&collection("c1", Placement::Sidebar))
            .await
            .unwrap();
        let mut mobile_only = collection("c2", Placement::Sidebar);
        mobile_only.target_devices = vec!["mobile".to_string()];
        storage.save_collection(&mobile_only).await.unwrap();

        storage.save_ad(&ad("low", "c1", 1, 0)).await.unwrap();
        storage.save_ad(&ad("high-2", "c1", 5, 2)).await.unwrap();
        storage.save_ad(&ad("high-1", "c1", 5, 1)).await.unwrap();
        storage.save_ad(&ad("mobile", "c2", 9, 0)).await.unwrap();
        let mut paused = ad("paused", "c1", 10, 0);
        paused.status = AdStatus::Paused;
        storage.save_ad(&paused).await.unwrap();

        let found = storage
            .find_candidates(&sidebar_criteria(), 10)
            .await
            .unwrap();
        let ids: Vec<_> = found.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["high-1", "high-2", "low"]);

        let found = storage
            .find_candidates(&sidebar_criteria(), 2)
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
    }

    #[tokio::test]
    async fn test_find_candidates_pinned_ad_and_popup_settings() {
        let storage = Storage::new("sqlite::memory:").await.unwrap();

        let mut c = collection("c1", Placement::Sidebar);
        c.popup_settings = Some(crate::model::PopupSettings {
            delay_secs: 3,
            dismissible: true,
        });
        storage.save_collection(&c).await.unwrap();
        storage.save_ad(&ad("a1", "c1", 1, 0)).await.unwrap();
        storage.save_ad(&ad("a2", "c1", 2, 0)).await.unwrap();

        let mut criteria = sidebar_criteria();
        criteria.ad_id = Some("a1".to_string());
        let found = storage.find_candidates(&criteria, 10).await.unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "a1");
        assert_eq!(found[0].popup_settings.map(|p| p.delay_secs), Some(3));
    }

    #[tokio::test]
    async fn test_find_ad() {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        let mut capped = ad("a1", "c1", 1, 0);
        capped.frequency = FrequencyRule::Unlimited {
            max_impressions: 10,
            max_clicks: 2,
            window_secs: Some(3600),
        };
        storage.save_ad(&capped).await.unwrap();

        assert_eq!(storage.find_ad("a1").await.unwrap(), Some(capped));
        assert!(storage.find_ad("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_load_inventory() {
        let storage = Storage::new("sqlite::memory:").await.unwrap();

        let path = std::env::temp_dir().join(format!("adselect-inventory-{}.json", std::process::id()));
        let inventory = serde_json::json!({
            "collections": [
                { "id": "c1", "name": "Books", "placement": "sidebar" }
            ],
            "ads": [
                {
                    "id": "a1",
                    "collectionId": "c1",
                    "placement": "sidebar",
                    "title": "Read more",
                    "status": "active",
                    "frequency": { "type": "once_per_page" }
                }
            ]
        });
        tokio::fs::write(&path, inventory.to_string()).await.unwrap();

        let loaded = storage.load_inventory(&path).await.unwrap();
        tokio::fs::remove_file(&path).await.unwrap();

        assert_eq!(loaded, (1, 1));
        let found = storage
            .find_candidates(&sidebar_criteria(), 10)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].frequency, FrequencyRule::OncePerPage);
    }
}
