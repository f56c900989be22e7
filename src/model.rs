//! Data models for adselect.
//!
//! # Wire Format
//!
//! Every type that crosses the HTTP boundary uses camelCase field names so
//! the page renderer can post its context as-is. Frequency rules are tagged
//! by a `type` field:
//!
//! ```json
//! { "type": "unlimited", "maxImpressions": 1000, "maxClicks": 0 }
//! { "type": "once_per_page" }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Target-list entry that matches any value.
pub const WILDCARD: &str = "all";

/// Upper bound on how many ads one selection may return.
pub const MAX_SELECTION_LIMIT: usize = 10;

/// Upper bound on caller-supplied dedup keys.
pub const MAX_EVENT_ID_LEN: usize = 256;

/// The slot type an ad is rendered into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    /// Between two sections of a listing page, addressed by `sectionIndex`.
    BetweenSections,
    /// Inside article body text, addressed by `paragraphIndex`.
    InArticle,
    Sidebar,
    Popup,
    /// A named slot addressed by `placementId`.
    Custom,
}

impl Placement {
    pub fn as_str(&self) -> &'static str {
        match self {
            Placement::BetweenSections => "between_sections",
            Placement::InArticle => "in_article",
            Placement::Sidebar => "sidebar",
            Placement::Popup => "popup",
            Placement::Custom => "custom",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "between_sections" => Some(Placement::BetweenSections),
            "in_article" => Some(Placement::InArticle),
            "sidebar" => Some(Placement::Sidebar),
            "popup" => Some(Placement::Popup),
            "custom" => Some(Placement::Custom),
            _ => None,
        }
    }
}

/// Lifecycle state of an ad. Only `Active` ads are ever selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdStatus {
    Active,
    Paused,
    Archived,
}

impl AdStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdStatus::Active => "active",
            AdStatus::Paused => "paused",
            AdStatus::Archived => "archived",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(AdStatus::Active),
            "paused" => Some(AdStatus::Paused),
            "archived" => Some(AdStatus::Archived),
            _ => None,
        }
    }
}

/// How often an ad may be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FrequencyRule {
    /// Not page-scoped. A cap of 0 on either axis means "no cap on that axis",
    /// never "zero allowed".
    Unlimited {
        #[serde(rename = "maxImpressions", default)]
        max_impressions: u32,
        #[serde(rename = "maxClicks", default)]
        max_clicks: u32,
        /// Count only events from the trailing window. Lifetime when absent.
        #[serde(rename = "windowSecs", default, skip_serializing_if = "Option::is_none")]
        window_secs: Option<u64>,
    },
    /// At most one impression per distinct page key per session.
    OncePerPage,
}

impl FrequencyRule {
    /// An unlimited rule with no caps at all.
    pub const UNCAPPED: FrequencyRule = FrequencyRule::Unlimited {
        max_impressions: 0,
        max_clicks: 0,
        window_secs: None,
    };

    /// Whether deciding eligibility needs any event history.
    pub fn is_capped(&self) -> bool {
        match self {
            FrequencyRule::Unlimited {
                max_impressions,
                max_clicks,
                ..
            } => *max_impressions > 0 || *max_clicks > 0,
            FrequencyRule::OncePerPage => true,
        }
    }
}

impl Default for FrequencyRule {
    fn default() -> Self {
        FrequencyRule::UNCAPPED
    }
}

/// Display options for popup collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PopupSettings {
    /// Seconds after page load before the popup opens.
    #[serde(default)]
    pub delay_secs: u32,
    #[serde(default = "default_true")]
    pub dismissible: bool,
}

fn default_true() -> bool {
    true
}

/// An advertisement creative belonging to a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ad {
    pub id: String,

    /// Owning collection. At most one ad per collection appears in a response.
    pub collection_id: String,

    pub placement: Placement,

    pub title: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_url: Option<String>,

    /// Higher priority is served first.
    #[serde(default)]
    pub priority: i32,

    /// Ascending tie-break within equal priority.
    #[serde(default)]
    pub order: i32,

    pub status: AdStatus,

    #[serde(default)]
    pub frequency: FrequencyRule,

    /// Copied from the owning collection when the ad is loaded as a candidate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub popup_settings: Option<PopupSettings>,
}

/// Kind of delivery event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Impression,
    Click,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Impression => "impression",
            EventType::Click => "click",
        }
    }
}

/// Builds the key that scopes `once_per_page` rules.
pub fn page_key(page_type: &str, page_url: &str) -> String {
    format!("{page_type}:{page_url}")
}

/// One recorded impression or click. Never updated once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdEvent {
    pub ad_id: String,

    /// Absent for un-sessioned requests; such events never dedupe per page.
    pub session_id: Option<String>,

    #[serde(rename = "type")]
    pub event_type: EventType,

    pub page_type: String,

    pub page_url: String,

    /// `{pageType}:{pageUrl}`.
    pub page_key: String,

    pub device: String,

    pub placement: Option<Placement>,

    /// Server-assigned.
    pub created_at: DateTime<Utc>,

    /// Caller-supplied dedup key. A second event with the same key is dropped.
    pub event_id: Option<String>,
}

impl AdEvent {
    /// Build an impression for an ad that was just selected for `request`.
    pub fn impression(ad: &Ad, request: &SelectionRequest, now: DateTime<Utc>) -> Self {
        Self {
            ad_id: ad.id.clone(),
            session_id: request.session_id.clone(),
            event_type: EventType::Impression,
            page_type: request.page_type.clone(),
            page_url: request.page_url.clone(),
            page_key: request.page_key(),
            device: request.device.clone(),
            placement: Some(request.placement),
            created_at: now,
            event_id: None,
        }
    }
}

/// Aggregated delivery counts for one ad.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventCounts {
    pub impressions: i64,
    pub clicks: i64,
}

/// The page-level inputs collection targeting is evaluated against.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetingContext {
    pub page_type: String,
    pub device: String,
    pub section_index: Option<u32>,
    pub is_logged_in: bool,
    pub country: Option<String>,
    pub category_id: Option<String>,
}

impl TargetingContext {
    pub fn user_type(&self) -> &'static str {
        if self.is_logged_in { "logged_in" } else { "guest" }
    }
}

/// Campaign-level targeting envelope around one or more ads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdCollection {
    pub id: String,

    pub name: String,

    pub placement: Placement,

    /// Only for `between_sections`. `None` matches every section.
    #[serde(default)]
    pub section_index: Option<u32>,

    /// Only for `in_article`. `None` matches every paragraph.
    #[serde(default)]
    pub paragraph_index: Option<u32>,

    /// Required for `custom`.
    #[serde(default)]
    pub placement_id: Option<String>,

    #[serde(default = "wildcard_list")]
    pub target_pages: Vec<String>,

    #[serde(default = "wildcard_list")]
    pub target_devices: Vec<String>,

    /// `logged_in`, `guest` or `all`.
    #[serde(default = "wildcard_list")]
    pub target_user_types: Vec<String>,

    #[serde(default = "wildcard_list")]
    pub target_countries: Vec<String>,

    #[serde(default = "wildcard_list")]
    pub target_categories: Vec<String>,

    #[serde(default)]
    pub popup_settings: Option<PopupSettings>,

    #[serde(default = "default_true")]
    pub is_active: bool,

    #[serde(default)]
    pub starts_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
}

fn wildcard_list() -> Vec<String> {
    vec![WILDCARD.to_string()]
}

/// True when `targets` is empty, contains the wildcard, or contains `value`
/// (case-insensitively).
fn target_matches(targets: &[String], value: Option<&str>) -> bool {
    if targets.is_empty() || targets.iter().any(|t| t == WILDCARD) {
        return true;
    }
    match value {
        Some(value) => targets.iter().any(|t| t.eq_ignore_ascii_case(value)),
        None => false,
    }
}

impl AdCollection {
    /// Pure targeting predicate over the page context.
    pub fn matches_context(&self, ctx: &TargetingContext) -> bool {
        if let (Some(wanted), Some(actual)) = (self.section_index, ctx.section_index) {
            if wanted != actual {
                return false;
            }
        }

        target_matches(&self.target_pages, Some(&ctx.page_type))
            && target_matches(&self.target_devices, Some(&ctx.device))
            && target_matches(&self.target_user_types, Some(ctx.user_type()))
            && target_matches(&self.target_countries, ctx.country.as_deref())
            && target_matches(&self.target_categories, ctx.category_id.as_deref())
    }

    /// Whether the collection's slot addressing agrees with the request.
    pub fn matches_slot(&self, criteria: &CandidateCriteria) -> bool {
        if self.placement != criteria.placement {
            return false;
        }
        if let (Some(wanted), Some(actual)) = (self.paragraph_index, criteria.paragraph_index) {
            if wanted != actual {
                return false;
            }
        }
        match self.placement {
            Placement::Custom => {
                self.placement_id.is_some() && self.placement_id == criteria.placement_id
            }
            _ => match (&self.placement_id, &criteria.placement_id) {
                (Some(wanted), Some(actual)) => wanted == actual,
                _ => true,
            },
        }
    }

    /// Active and inside its optional schedule.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.is_active
            && self.starts_at.is_none_or(|start| start <= now)
            && self.ends_at.is_none_or(|end| now < end)
    }
}

/// What the candidate repository is asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateCriteria {
    pub placement: Placement,
    pub paragraph_index: Option<u32>,
    pub placement_id: Option<String>,
    /// Restrict to one ad, e.g. for a pinned slot.
    pub ad_id: Option<String>,
    pub article_id: Option<String>,
    pub context: TargetingContext,
}

/// Request body for POST /ads/select.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionRequest {
    pub placement: Placement,
    pub page_type: String,
    pub device: String,
    #[serde(default, deserialize_with = "blank_as_none")]
    pub session_id: Option<String>,
    pub page_url: String,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub article_id: Option<String>,
    #[serde(default)]
    pub section_index: Option<u32>,
    #[serde(default)]
    pub paragraph_index: Option<u32>,
    #[serde(default)]
    pub placement_id: Option<String>,
    #[serde(default)]
    pub ad_id: Option<String>,
    #[serde(default)]
    pub is_logged_in: bool,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub exclude_collection_ids: Vec<String>,
    #[serde(default)]
    pub exclude_ad_ids: Vec<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    1
}

/// Read an optional string, mapping empty or whitespace-only values to
/// `None`.
fn blank_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.filter(|v| !v.trim().is_empty()))
}

fn require(value: &str, field: &'static str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::MissingField(field));
    }
    Ok(())
}

impl SelectionRequest {
    /// Reject requests missing the context the engine keys on.
    pub fn validate(&self) -> Result<(), ValidationError> {
        require(&self.page_type, "pageType")?;
        require(&self.page_url, "pageUrl")?;
        require(&self.device, "device")?;
        if self.limit == 0 || self.limit > MAX_SELECTION_LIMIT {
            return Err(ValidationError::LimitOutOfRange {
                got: self.limit,
                max: MAX_SELECTION_LIMIT,
            });
        }
        Ok(())
    }

    pub fn page_key(&self) -> String {
        page_key(&self.page_type, &self.page_url)
    }

    pub fn criteria(&self) -> CandidateCriteria {
        CandidateCriteria {
            placement: self.placement,
            paragraph_index: self.paragraph_index,
            placement_id: self.placement_id.clone(),
            ad_id: self.ad_id.clone(),
            article_id: self.article_id.clone(),
            context: TargetingContext {
                page_type: self.page_type.clone(),
                device: self.device.clone(),
                section_index: self.section_index,
                is_logged_in: self.is_logged_in,
                country: self.country.clone(),
                category_id: self.category_id.clone(),
            },
        }
    }
}

/// Response body for POST /ads/select.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionResponse {
    pub ads: Vec<Ad>,
}

/// Request body for POST /ads/track.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackRequest {
    pub ad_id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub page_type: String,
    pub page_url: String,
    #[serde(default)]
    pub device: String,
    #[serde(default)]
    pub placement: Option<Placement>,
    #[serde(default, deserialize_with = "blank_as_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub event_id: Option<String>,
}

impl TrackRequest {
    pub fn validate(&self) -> Result<(), ValidationError> {
        require(&self.ad_id, "adId")?;
        require(&self.page_type, "pageType")?;
        require(&self.page_url, "pageUrl")?;
        if let Some(event_id) = &self.event_id {
            require(event_id, "eventId")?;
            if event_id.len() > MAX_EVENT_ID_LEN {
                return Err(ValidationError::EventIdTooLong {
                    max: MAX_EVENT_ID_LEN,
                });
            }
        }
        Ok(())
    }

    /// Turn the tracked request into an event with a server-assigned time.
    pub fn into_event(self, now: DateTime<Utc>) -> AdEvent {
        AdEvent {
            page_key: page_key(&self.page_type, &self.page_url),
            ad_id: self.ad_id,
            session_id: self.session_id,
            event_type: self.event_type,
            page_type: self.page_type,
            page_url: self.page_url,
            device: self.device,
            placement: self.placement,
            created_at: now,
            event_id: self.event_id,
        }
    }
}

/// Response body for POST /ads/track. `recorded: false` means deduped or
/// blocked and is still a success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackResponse {
    pub success: bool,
    pub recorded: bool,
}

/// Bulk inventory file loaded at startup.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub collections: Vec<AdCollection>,
    #[serde(default)]
    pub ads: Vec<Ad>,
}
