//! Idempotent write path for impressions and clicks.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::model::{AdEvent, AdStatus, TrackRequest, TrackResponse};
use crate::store::{CandidateRepository, EventStore, with_timeout};

/// Result of a single record call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordOutcome {
    /// `false` when the event was a duplicate of an earlier `event_id`.
    pub recorded: bool,
}

/// Writes delivery events to the event store.
///
/// Deduplication relies on the store's atomic insert-or-ignore on
/// `event_id`, so concurrent calls with one key produce exactly one row.
#[derive(Clone)]
pub struct EventRecorder {
    events: Arc<dyn EventStore>,
    ads: Arc<dyn CandidateRepository>,
    timeout: Duration,
}

impl EventRecorder {
    pub fn new(
        events: Arc<dyn EventStore>,
        ads: Arc<dyn CandidateRepository>,
        timeout: Duration,
    ) -> Self {
        Self {
            events,
            ads,
            timeout,
        }
    }

    /// Persist one event unless its `event_id` was already recorded.
    pub async fn record(&self, event: &AdEvent) -> Result<RecordOutcome, StoreError> {
        let recorded = with_timeout("event insert", self.timeout, self.events.record(event)).await?;

        if !recorded {
            debug!(
                ad_id = %event.ad_id,
                event_type = event.event_type.as_str(),
                "Duplicate event ignored"
            );
        }

        Ok(RecordOutcome { recorded })
    }

    /// Record an event reported by a page.
    ///
    /// Events for unknown or non-active ads are blocked and reported as
    /// `recorded: false`, which callers treat as success.
    pub async fn track_event(&self, request: TrackRequest) -> Result<TrackResponse, StoreError> {
        let ad = with_timeout("ad lookup", self.timeout, self.ads.find_ad(&request.ad_id)).await?;

        let blocked = match &ad {
            None => Some("unknown ad"),
            Some(ad) if ad.status != AdStatus::Active => Some("ad not active"),
            Some(_) => None,
        };
        if let Some(reason) = blocked {
            info!(ad_id = %request.ad_id, reason, "Tracked event blocked");
            return Ok(TrackResponse {
                success: true,
                recorded: false,
            });
        }

        let event = request.into_event(Utc::now());
        let outcome = self.record(&event).await?;

        info!(
            ad_id = %event.ad_id,
            event_type = event.event_type.as_str(),
            recorded = outcome.recorded,
            "Event tracked"
        );

        Ok(TrackResponse {
            success: true,
            recorded: outcome.recorded,
        })
    }
}
