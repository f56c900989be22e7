//! Frequency control: filter candidates down to the ads a session may see.
//!
//! # Rules
//!
//! - `once_per_page`: excluded when the session already has an impression
//!   of that ad on the same page key. Another page key is a fresh page.
//! - `unlimited` with caps: excluded once observed impressions or clicks
//!   reach a positive cap. A cap of 0 never excludes.
//! - `unlimited` without caps: always passes.
//!
//! # Failure Semantics
//!
//! Any store error or timeout excludes the ads whose decision depended on
//! the failed lookup. An outage shrinks inventory; it never lets a capped ad
//! through.
//!
//! # Concurrency
//!
//! Caps are soft across concurrent requests. Two page loads of the same
//! session and page key may both see "not yet shown" and both serve the ad.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::model::{Ad, EventCounts, EventType, FrequencyRule};
use crate::store::{EventStore, with_timeout};

/// Filter `candidates` to those eligible for this session and page,
/// preserving input order. Has no side effects.
///
/// # Arguments
///
/// * `store` - Event history
/// * `candidates` - Ads in priority order
/// * `session_id` - Caller session, if any. Without one (or with a blank
///   one), per-page rules cannot be checked and pass.
/// * `page_key` - `{pageType}:{pageUrl}`
/// * `timeout` - Deadline for each store lookup. At most one lookup per
///   counting window plus one for the page history.
pub async fn apply_frequency_control(
    store: &dyn EventStore,
    candidates: Vec<Ad>,
    session_id: Option<&str>,
    page_key: &str,
    timeout: Duration,
) -> Vec<Ad> {
    let now = Utc::now();
    let mut excluded: HashSet<String> = HashSet::new();

    // Group capped ads by counting window so each window costs one query
    let mut by_window: HashMap<Option<u64>, Vec<String>> = HashMap::new();
    for ad in &candidates {
        if let FrequencyRule::Unlimited { window_secs, .. } = ad.frequency {
            if ad.frequency.is_capped() {
                by_window.entry(window_secs).or_default().push(ad.id.clone());
            }
        }
    }

    let mut counts: HashMap<String, EventCounts> = HashMap::new();
    for (window_secs, ad_ids) in by_window {
        let since = window_start(now, window_secs);
        let lookup = with_timeout(
            "event count lookup",
            timeout,
            store.counts_for_ads(&ad_ids, since),
        )
        .await;
        match lookup {
            Ok(found) => counts.extend(found),
            Err(e) => {
                warn!(
                    ads = ad_ids.len(),
                    error = %e,
                    "Frequency counts unavailable, excluding capped ads"
                );
                excluded.extend(ad_ids);
            }
        }
    }

    // A blank session cannot tell two visitors apart, so it is no session
    let session_id = session_id.filter(|s| !s.trim().is_empty());
    let per_page: Vec<String> = candidates
        .iter()
        .filter(|ad| ad.frequency == FrequencyRule::OncePerPage)
        .map(|ad| ad.id.clone())
        .collect();
    if let Some(session_id) = session_id
        && !per_page.is_empty()
    {
        let lookup = with_timeout(
            "page impression lookup",
            timeout,
            store.shown_on_page(&per_page, session_id, page_key, EventType::Impression),
        )
        .await;
        match lookup {
            Ok(shown) => {
                for ad_id in shown {
                    debug!(ad_id = %ad_id, page_key, "Already shown on this page");
                    excluded.insert(ad_id);
                }
            }
            Err(e) => {
                warn!(
                    ads = per_page.len(),
                    error = %e,
                    "Page history unavailable, excluding once-per-page ads"
                );
                excluded.extend(per_page);
            }
        }
    }

    for ad in &candidates {
        if excluded.contains(&ad.id) {
            continue;
        }
        let observed = counts.get(&ad.id).copied().unwrap_or_default();
        if !within_caps(&ad.frequency, observed) {
            debug!(
                ad_id = %ad.id,
                impressions = observed.impressions,
                clicks = observed.clicks,
                "Frequency cap reached"
            );
            excluded.insert(ad.id.clone());
        }
    }

    candidates
        .into_iter()
        .filter(|ad| !excluded.contains(&ad.id))
        .collect()
}

/// Whether observed counts are still under the rule's caps. Page-scoped
/// rules have no count caps and always pass here.
pub fn within_caps(rule: &FrequencyRule, observed: EventCounts) -> bool {
    match *rule {
        FrequencyRule::Unlimited {
            max_impressions,
            max_clicks,
            ..
        } => {
            let impressions_ok =
                max_impressions == 0 || observed.impressions < i64::from(max_impressions);
            let clicks_ok = max_clicks == 0 || observed.clicks < i64::from(max_clicks);
            impressions_ok && clicks_ok
        }
        FrequencyRule::OncePerPage => true,
    }
}

/// Start of a trailing counting window, or `None` for lifetime counting.
fn window_start(now: DateTime<Utc>, window_secs: Option<u64>) -> Option<DateTime<Utc>> {
    let secs = i64::try_from(window_secs?).ok()?;
    now.checked_sub_signed(chrono::Duration::try_seconds(secs)?)
}
