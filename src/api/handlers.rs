/// API request handlers
use crate::api::auth::AuthService;
use crate::api::middleware::AgentIdentity;
use crate::api::models::*;
use crate::attendance::AttendanceGate;
use crate::engine::{FieldEngine, Services};
use crate::error::FieldError;
use crate::gate::Reading;
use crate::persistence::Persistence;
use crate::types::Coord;
use axum::{
    extract::{Extension, Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 500;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub persistence: Persistence,
    pub engine: Arc<FieldEngine>,
    pub attendance: Arc<AttendanceGate>,
    pub auth_service: Arc<AuthService>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(services: &Services, auth_service: AuthService) -> Self {
        Self {
            persistence: services.persistence.clone(),
            engine: services.engine.clone(),
            attendance: services.attendance.clone(),
            auth_service: Arc::new(auth_service),
            start_time: Instant::now(),
        }
    }
}

pub fn status_for(err: &FieldError) -> StatusCode {
    match err {
        FieldError::InvalidCoordinate { .. } | FieldError::InvalidReading(_) => {
            StatusCode::BAD_REQUEST
        }
        FieldError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        FieldError::AgentNotFound { .. } | FieldError::ZoneNotFound { .. } => {
            StatusCode::NOT_FOUND
        }
        FieldError::DuplicateClockIn { .. }
        | FieldError::NoOpenSession { .. }
        | FieldError::StaleReading { .. } => StatusCode::CONFLICT,
        FieldError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn error_response(err: &FieldError) -> Response {
    let status = status_for(err);
    if status.is_server_error() {
        tracing::error!("Request failed: {:#}", err);
    } else {
        tracing::debug!("Request rejected: {}", err);
    }
    (status, Json(ErrorResponse::new(err.code(), err.to_string()))).into_response()
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

/// Ingest a location pulse for the current agent
pub async fn pulse(
    State(state): State<AppState>,
    Extension(identity): Extension<AgentIdentity>,
    Json(request): Json<PulseRequest>,
) -> Response {
    let recorded_at = request.recorded_at.unwrap_or_else(Utc::now);
    let reading = match Reading::new(request.lat, request.lng, request.accuracy_meters, recorded_at) {
        Ok(reading) => reading,
        Err(e) => return error_response(&e),
    };

    match state.engine.ingest_pulse(&identity.agent_id, reading).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => error_response(&e),
    }
}

pub async fn clock_in(
    State(state): State<AppState>,
    Extension(identity): Extension<AgentIdentity>,
    Json(request): Json<ClockInRequest>,
) -> Response {
    let position = Coord::new(request.lat, request.lng);
    match state
        .attendance
        .clock_in(&identity.agent_id, position, Utc::now())
        .await
    {
        Ok(session) => (StatusCode::CREATED, Json(session)).into_response(),
        Err(e) => error_response(&e),
    }
}

pub async fn clock_out(
    State(state): State<AppState>,
    Extension(identity): Extension<AgentIdentity>,
) -> Response {
    match state.attendance.clock_out(&identity.agent_id, Utc::now()).await {
        Ok(session) => Json(session).into_response(),
        Err(e) => error_response(&e),
    }
}

pub async fn attendance_today(
    State(state): State<AppState>,
    Extension(identity): Extension<AgentIdentity>,
) -> Response {
    let today = Utc::now().date_naive();
    match state.attendance.sessions_on(&identity.agent_id, today) {
        Ok(sessions) => Json(sessions).into_response(),
        Err(e) => error_response(&e),
    }
}

pub async fn screen_transaction(
    State(state): State<AppState>,
    Extension(identity): Extension<AgentIdentity>,
    Json(request): Json<ScreenRequest>,
) -> Response {
    match state
        .engine
        .screen_transaction(
            &identity.agent_id,
            request.amount,
            request.average_amount,
            Utc::now(),
        )
        .await
    {
        Ok(screen) => Json(screen).into_response(),
        Err(e) => error_response(&e),
    }
}

fn history_limit(query: &HistoryQuery) -> usize {
    query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT)
}

/// Zone transitions for an agent, most recent first
pub async fn list_transitions(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    match state
        .persistence
        .list_transitions(&agent_id, history_limit(&query))
    {
        Ok(events) => Json(events).into_response(),
        Err(e) => error_response(&FieldError::from(e)),
    }
}

/// Compliance records for an agent, most recent first
pub async fn list_compliance(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    match state
        .persistence
        .list_compliance_records(&agent_id, history_limit(&query))
    {
        Ok(records) => Json(records).into_response(),
        Err(e) => error_response(&FieldError::from(e)),
    }
}

/// Drop the cached context so zone/agent edits apply on the next pulse
pub async fn invalidate_context(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> impl IntoResponse {
    let invalidated = state.engine.cache().invalidate(&agent_id).await;
    Json(InvalidateResponse {
        agent_id,
        invalidated,
    })
}
