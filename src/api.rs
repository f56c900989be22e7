//! HTTP API handlers for adselect.
//!
//! - **POST /ads/select**: Pick ads for a slot. Never fails because of
//!   missing inventory or a degraded store; the worst case is `{"ads": []}`.
//! - **POST /ads/track**: Record an impression or click reported by a page.
//!   A deduplicated or blocked event is still `200` with `recorded: false`.
//! - **GET /health**: Health check.
//!
//! Neither endpoint authenticates its caller; rate limiting belongs to the
//! fronting proxy.

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{instrument, warn};

use crate::error::ValidationError;
use crate::model::{SelectionRequest, SelectionResponse, TrackRequest, TrackResponse};
use crate::selection::AdSelector;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub selector: AdSelector,
}

/// Error body for non-2xx responses.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn bad_request(e: ValidationError) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
}

/// Build the service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ads/select", post(post_select))
        .route("/ads/track", post(post_track))
        .route("/health", get(health_check))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

/// POST /ads/select - Select ads for a placement.
///
/// # Request Body
///
/// ```json
/// {
///     "placement": "between_sections",
///     "pageType": "category",
///     "pageUrl": "/politics",
///     "device": "mobile",
///     "sessionId": "6f1c...",
///     "sectionIndex": 2,
///     "excludeCollectionIds": ["c-17"],
///     "limit": 2
/// }
/// ```
///
/// # Response
///
/// `{"ads": [...]}`, possibly empty. `400` when required context is missing.
#[instrument(skip(state, request))]
pub async fn post_select(
    State(state): State<AppState>,
    Json(request): Json<SelectionRequest>,
) -> Result<Json<SelectionResponse>, ApiError> {
    request.validate().map_err(|e| {
        warn!(error = %e, "Rejected selection request");
        bad_request(e)
    })?;

    let ads = state.selector.select_ads(&request).await;
    Ok(Json(SelectionResponse { ads }))
}

/// POST /ads/track - Record an impression or click.
///
/// # Request Body
///
/// ```json
/// {
///     "adId": "x",
///     "type": "click",
///     "pageType": "article",
///     "pageUrl": "/p",
///     "device": "desktop",
///     "placement": "sidebar",
///     "eventId": "x:1000:/p"
/// }
/// ```
///
/// # Response
///
/// `{"success": true, "recorded": bool}`.
#[instrument(skip(state, request), fields(ad_id = %request.ad_id))]
pub async fn post_track(
    State(state): State<AppState>,
    Json(request): Json<TrackRequest>,
) -> Result<Json<TrackResponse>, ApiError> {
    request.validate().map_err(|e| {
        warn!(error = %e, "Rejected track request");
        bad_request(e)
    })?;

    match state.selector.recorder().track_event(request).await {
        Ok(response) => Ok(Json(response)),
        Err(e) => {
            warn!(error = %e, "Failed to track event");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "failed to record event".to_string(),
                }),
            ))
        }
    }
}

/// GET /health - Simple health check endpoint.
pub async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}
