use crate::api::responses::{
    HealthErrorCode, HealthErrorResponse, HealthStatus, HealthSuccessResponse, PassReport,
    PhaseResponse, PhasesErrorCode, PhasesErrorResponse, PhasesSuccessResponse,
};
use crate::classification::scheduler::PassSummary;
use crate::state::AppState;
use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::error;

const INTERNAL_ERROR_MESSAGE: &str = "Internal server error";

/// A pass older than this many intervals marks the service degraded.
const STALE_AFTER_INTERVALS: u32 = 2;

#[derive(Debug)]
enum TimestampError {
    Format(time::error::Format),
}

impl fmt::Display for TimestampError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimestampError::Format(err) => write!(f, "timestamp format error: {err}"),
        }
    }
}

pub enum HealthResponse {
    Success {
        status: StatusCode,
        body: HealthSuccessResponse,
    },
    Error {
        status: StatusCode,
        body: HealthErrorResponse,
    },
}

impl IntoResponse for HealthResponse {
    fn into_response(self) -> Response {
        match self {
            HealthResponse::Success { status, body } => (status, Json(body)).into_response(),
            HealthResponse::Error { status, body } => (status, Json(body)).into_response(),
        }
    }
}

pub async fn get_health(State(state): State<Arc<RwLock<AppState>>>) -> impl IntoResponse {
    build_health_response(state, OffsetDateTime::now_utc())
}

pub enum PhasesResponse {
    Success(PhasesSuccessResponse),
    Error {
        status: StatusCode,
        body: PhasesErrorResponse,
    },
}

impl IntoResponse for PhasesResponse {
    fn into_response(self) -> Response {
        match self {
            PhasesResponse::Success(body) => (StatusCode::OK, Json(body)).into_response(),
            PhasesResponse::Error { status, body } => (status, Json(body)).into_response(),
        }
    }
}

pub async fn get_phases(State(state): State<Arc<RwLock<AppState>>>) -> impl IntoResponse {
    build_phases_response(state, OffsetDateTime::now_utc())
}

fn format_timestamp(timestamp: OffsetDateTime) -> Result<String, TimestampError> {
    timestamp.format(&Rfc3339).map_err(TimestampError::Format)
}

fn fallback_timestamp() -> String {
    format_timestamp(OffsetDateTime::now_utc()).unwrap_or_else(|err| {
        error!(error = %err, "Failed to format error timestamp");
        "1970-01-01T00:00:00Z".to_string()
    })
}

fn build_health_response(state: Arc<RwLock<AppState>>, now: OffsetDateTime) -> HealthResponse {
    let guard = match state.read() {
        Ok(guard) => guard,
        Err(_) => {
            return health_internal_error("state lock poisoned while reading last pass");
        }
    };

    let (status, last_pass) = match guard.last_pass() {
        None => (HealthStatus::Ko, None),
        Some(pass) => {
            let status = derive_health_status(pass, guard.interval(), now);
            match pass_report(pass) {
                Ok(report) => (status, Some(report)),
                Err(_) => {
                    drop(guard);
                    return health_internal_error("timestamp formatting failure");
                }
            }
        }
    };
    drop(guard);

    let timestamp = match format_timestamp(now) {
        Ok(formatted) => formatted,
        Err(_) => {
            return health_internal_error("timestamp formatting failure");
        }
    };

    let status_code = match status {
        HealthStatus::Ko => StatusCode::SERVICE_UNAVAILABLE,
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
    };

    HealthResponse::Success {
        status: status_code,
        body: HealthSuccessResponse {
            status,
            last_pass,
            timestamp,
        },
    }
}

fn derive_health_status(pass: &PassSummary, interval: Duration, now: OffsetDateTime) -> HealthStatus {
    let stale_after = interval.saturating_mul(STALE_AFTER_INTERVALS);
    let age = now - pass.finished_at;
    let is_stale = age.is_positive() && age.unsigned_abs() > stale_after;

    if !pass.is_clean() || is_stale {
        HealthStatus::Degraded
    } else {
        HealthStatus::Ok
    }
}

fn pass_report(pass: &PassSummary) -> Result<PassReport, TimestampError> {
    Ok(PassReport {
        started_at: format_timestamp(pass.started_at)?,
        finished_at: format_timestamp(pass.finished_at)?,
        devices: pass.devices,
        classified: pass.classified,
        skipped: pass.skipped,
        failed: pass.failed,
        transitions: pass.transitions,
    })
}

fn health_internal_error(message: &str) -> HealthResponse {
    error!(
        message = message,
        "Internal error while handling /api/health"
    );
    HealthResponse::Error {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        body: HealthErrorResponse {
            error_code: HealthErrorCode::InternalError,
            error_message: INTERNAL_ERROR_MESSAGE.to_string(),
            timestamp: fallback_timestamp(),
        },
    }
}

fn build_phases_response(state: Arc<RwLock<AppState>>, now: OffsetDateTime) -> PhasesResponse {
    let guard = match state.read() {
        Ok(guard) => guard,
        Err(_) => {
            return phases_internal_error("state lock poisoned while reading estimates");
        }
    };

    let estimates = guard.estimates();
    if estimates.is_empty() {
        drop(guard);
        return phases_no_data_response(now);
    }

    let mut phases = Vec::with_capacity(estimates.len());
    for estimate in estimates {
        match format_timestamp(estimate.timestamp) {
            Ok(classified_at) => phases.push(PhaseResponse {
                device: estimate.device_id.clone(),
                phase: estimate.phase.clone(),
                probabilities: estimate.probabilities.clone(),
                classified_at,
            }),
            Err(_) => {
                drop(guard);
                return phases_internal_error("timestamp formatting failure");
            }
        }
    }
    drop(guard);

    match format_timestamp(now) {
        Ok(timestamp) => PhasesResponse::Success(PhasesSuccessResponse { phases, timestamp }),
        Err(_) => phases_internal_error("timestamp formatting failure"),
    }
}

fn phases_no_data_response(now: OffsetDateTime) -> PhasesResponse {
    match format_timestamp(now) {
        Ok(formatted) => PhasesResponse::Error {
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: PhasesErrorResponse {
                error_code: PhasesErrorCode::NoData,
                error_message: "No phase estimates available".to_string(),
                timestamp: formatted,
            },
        },
        Err(_) => phases_internal_error("timestamp formatting failure"),
    }
}

fn phases_internal_error(message: &str) -> PhasesResponse {
    error!(
        message = message,
        "Internal error while handling /api/phases"
    );
    PhasesResponse::Error {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        body: PhasesErrorResponse {
            error_code: PhasesErrorCode::InternalError,
            error_message: INTERNAL_ERROR_MESSAGE.to_string(),
            timestamp: fallback_timestamp(),
        },
    }
}
