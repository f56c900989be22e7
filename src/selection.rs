//! Selection orchestrator: turns a placement request into winning ads.
//!
//! # Protocol
//!
//! 1. Fingerprint the request and consult the selection cache. A hit is
//!    returned as-is and records nothing.
//! 2. On a miss, over-fetch candidates from the repository.
//! 3. Drop caller-excluded ads and collections.
//! 4. Apply frequency control for the request's page key.
//! 5. Sort by `(priority desc, order asc)`, then keep the first ad of each
//!    collection until `limit` winners are accepted.
//! 6. If that came up short and the fetch filled its page, widen the fetch
//!    once and retry.
//! 7. Record one impression per winner.
//! 8. Cache the winners, unless any impression failed to record.
//!
//! Dependency failures are logged and absorbed. The caller only ever sees
//! fewer ads, down to none.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::cache::fingerprint;
use crate::config::SelectionConfig;
use crate::frequency::apply_frequency_control;
use crate::model::{Ad, AdEvent, SelectionRequest};
use crate::recorder::EventRecorder;
use crate::store::{CandidateRepository, EventStore, SelectionCache, with_timeout};

/// Candidate fetches never ask for more than this many rows.
const MAX_FETCH_LIMIT: usize = 100;

/// Multiplier applied to the fetch size on the single widening retry.
const WIDEN_FACTOR: usize = 4;

/// Drives end-to-end ad selection.
#[derive(Clone)]
pub struct AdSelector {
    candidates: Arc<dyn CandidateRepository>,
    events: Arc<dyn EventStore>,
    cache: Arc<dyn SelectionCache>,
    recorder: EventRecorder,
    config: SelectionConfig,
}

impl AdSelector {
    pub fn new(
        candidates: Arc<dyn CandidateRepository>,
        events: Arc<dyn EventStore>,
        cache: Arc<dyn SelectionCache>,
        config: SelectionConfig,
    ) -> Self {
        let recorder = EventRecorder::new(
            events.clone(),
            candidates.clone(),
            config.dependency_timeout,
        );
        Self {
            candidates,
            events,
            cache,
            recorder,
            config,
        }
    }

    pub fn recorder(&self) -> &EventRecorder {
        &self.recorder
    }

    /// Select up to `request.limit` ads. Never fails; an empty list means
    /// "render no ad".
    #[instrument(skip(self, request), fields(placement = request.placement.as_str(), page_type = %request.page_type))]
    pub async fn select_ads(&self, request: &SelectionRequest) -> Vec<Ad> {
        let timeout = self.config.dependency_timeout;
        let key = fingerprint(request);

        match with_timeout("cache get", timeout, self.cache.get(&key)).await {
            Ok(Some(cached)) => {
                debug!(winners = cached.len(), "Selection cache hit");
                return cached;
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Selection cache unavailable, treating as miss"),
        }

        let mut fetch_limit = initial_fetch_limit(request, self.config.overfetch_factor);
        let mut widened = false;
        let winners = loop {
            let fetched = match with_timeout(
                "candidate lookup",
                timeout,
                self.candidates.find_candidates(&request.criteria(), fetch_limit),
            )
            .await
            {
                Ok(fetched) => fetched,
                Err(e) => {
                    warn!(error = %e, "Candidate lookup failed, serving nothing");
                    return Vec::new();
                }
            };
            let exhausted = fetched.len() < fetch_limit;

            let remaining = apply_exclusions(fetched, request);
            let eligible = apply_frequency_control(
                self.events.as_ref(),
                remaining,
                request.session_id.as_deref(),
                &request.page_key(),
                timeout,
            )
            .await;
            let selected = dedupe_by_collection(sort_by_priority(eligible), request.limit);

            if selected.len() >= request.limit
                || exhausted
                || widened
                || fetch_limit >= MAX_FETCH_LIMIT
            {
                break selected;
            }

            let next = (fetch_limit * WIDEN_FACTOR).min(MAX_FETCH_LIMIT);
            debug!(
                accepted = selected.len(),
                from = fetch_limit,
                to = next,
                "Widening candidate fetch"
            );
            fetch_limit = next;
            widened = true;
        };

        let mut all_recorded = true;
        let now = Utc::now();
        for ad in &winners {
            let impression = AdEvent::impression(ad, request, now);
            if let Err(e) = self.recorder.record(&impression).await {
                warn!(ad_id = %ad.id, error = %e, "Failed to record impression");
                all_recorded = false;
            }
        }

        if all_recorded {
            if let Err(e) = with_timeout(
                "cache set",
                timeout,
                self.cache.set(&key, winners.clone(), self.config.cache_ttl),
            )
            .await
            {
                warn!(error = %e, "Failed to cache selection");
            }
        }

        info!(winners = winners.len(), "Ads selected");
        winners
    }
}

/// Over-fetch so exclusions and frequency filtering still leave `limit` ads.
fn initial_fetch_limit(request: &SelectionRequest, overfetch_factor: usize) -> usize {
    let by_factor = request.limit.saturating_mul(overfetch_factor.max(1));
    let by_exclusions =
        request.limit + request.exclude_collection_ids.len() + request.exclude_ad_ids.len();
    by_factor.max(by_exclusions).min(MAX_FETCH_LIMIT)
}

/// Drop ads the caller already has, by ad id or by collection.
pub fn apply_exclusions(candidates: Vec<Ad>, request: &SelectionRequest) -> Vec<Ad> {
    if request.exclude_ad_ids.is_empty() && request.exclude_collection_ids.is_empty() {
        return candidates;
    }
    let ad_ids: HashSet<&str> = request.exclude_ad_ids.iter().map(String::as_str).collect();
    let collection_ids: HashSet<&str> = request
        .exclude_collection_ids
        .iter()
        .map(String::as_str)
        .collect();

    candidates
        .into_iter()
        .filter(|ad| {
            !ad_ids.contains(ad.id.as_str()) && !collection_ids.contains(ad.collection_id.as_str())
        })
        .collect()
}

/// Stable sort by priority descending, then order ascending. Equal keys keep
/// their input order.
pub fn sort_by_priority(mut ads: Vec<Ad>) -> Vec<Ad> {
    ads.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.order.cmp(&b.order)));
    ads
}

/// Keep the first ad of each collection, in order, up to `limit` ads.
pub fn dedupe_by_collection(ads: Vec<Ad>, limit: usize) -> Vec<Ad> {
    let mut seen = HashSet::new();
    let mut accepted = Vec::with_capacity(limit);
    for ad in ads {
        if accepted.len() >= limit {
            break;
        }
        if seen.insert(ad.collection_id.clone()) {
            accepted.push(ad);
        }
    }
    accepted
}
