use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::event::CompactEvent;
use crate::state::{ReconstructedState, StateReconstructor};
use crate::store::EventStore;

/// Shared state for the timeline endpoint.
pub struct TimelineAppState {
    pub reconstructor: Arc<StateReconstructor>,
    pub events: Arc<EventStore>,
}

/// Query parameters for timeline reconstruction
#[derive(Deserialize)]
pub struct TimelineParams {
    /// ISO 8601 reconstruction anchor (required)
    pub start_time: Option<String>,
    /// ISO 8601 replay cutoff (default: now)
    pub end_time: Option<String>,
}

#[derive(Serialize)]
struct TimelineResponse {
    snapshot: ReconstructedState,
    events: Vec<CompactEvent>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

pub fn create_timeline_router(state: Arc<TimelineAppState>) -> Router {
    Router::new()
        .route("/timeline", get(get_timeline))
        .with_state(state)
}

/// GET /timeline?start_time=T&end_time=T
///
/// Returns the reconstructed state at `start_time` plus the compact events
/// between the reconstruction anchor and `end_time`.
async fn get_timeline(
    State(state): State<Arc<TimelineAppState>>,
    Query(params): Query<TimelineParams>,
) -> Response {
    let start_time = match params.start_time.as_deref() {
        None => return bad_request("start_time parameter is required".to_string()),
        Some(raw) => match parse_iso8601(raw) {
            Ok(start_time) => start_time,
            Err(message) => return bad_request(message),
        },
    };

    let end_time = match params.end_time.as_deref() {
        None => Utc::now(),
        Some(raw) => match parse_iso8601(raw) {
            Ok(end_time) => end_time,
            Err(message) => return bad_request(message),
        },
    };

    let snapshot = match state.reconstructor.get_state_at(start_time) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            error!(error = %e, "timeline reconstruction failed");
            return internal_error();
        }
    };

    let events = match state
        .events
        .get_timeline_between(snapshot.last_event_id.unwrap_or(0), end_time)
    {
        Ok(events) => events,
        Err(e) => {
            error!(error = %e, "timeline event query failed");
            return internal_error();
        }
    };

    Json(TimelineResponse { snapshot, events }).into_response()
}

fn parse_iso8601(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|_| format!("invalid timestamp '{raw}' (expected ISO 8601)"))
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(ErrorResponse { error: message })).into_response()
}

fn internal_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: "timeline query failed".to_string(),
        }),
    )
        .into_response()
}
