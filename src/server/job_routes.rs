//! Job, work and webhook routes.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, warn};

use super::metrics;
use super::state::{GuardedDispatchManager, ServerState};
use crate::dispatch::{DispatchError, JobSpec, JobStatus, WebhookPayload, WorkerInfo};

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

#[derive(Deserialize, Debug)]
struct ListJobsQuery {
    status: Option<String>,
}

fn status_ok() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

fn error_response(err: DispatchError, endpoint: &str) -> Response {
    let (status, error) = match &err {
        DispatchError::NotFound(_) => (StatusCode::NOT_FOUND, "Job Not Found"),
        DispatchError::InvalidTransition { .. }
        | DispatchError::NotRunning(_)
        | DispatchError::ValidationFailed(_) => (StatusCode::BAD_REQUEST, "Bad Request"),
        DispatchError::DuplicateId(_) => (StatusCode::CONFLICT, "Conflict"),
        DispatchError::StorageUnavailable(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable")
        }
    };

    if err.is_transient() {
        error!("{} failed: {:#}", endpoint, err);
    } else {
        warn!("{} rejected: {}", endpoint, err);
    }
    metrics::record_error(err.kind(), endpoint);

    (
        status,
        Json(ErrorBody {
            error,
            message: err.to_string(),
        }),
    )
        .into_response()
}

async fn create_job(
    State(manager): State<GuardedDispatchManager>,
    Json(spec): Json<JobSpec>,
) -> Response {
    match manager.create_job(spec) {
        Ok(job) => (StatusCode::CREATED, Json(job)).into_response(),
        Err(err) => error_response(err, "/job"),
    }
}

async fn list_jobs(
    State(manager): State<GuardedDispatchManager>,
    Query(query): Query<ListJobsQuery>,
) -> Response {
    let status = match query.status.as_deref() {
        None | Some("") => None,
        Some(raw) => match JobStatus::from_str(raw) {
            Some(status) => Some(status),
            None => {
                let err = DispatchError::ValidationFailed(format!("unknown status: {}", raw));
                return error_response(err, "/jobs");
            }
        },
    };
    match manager.list_jobs(status) {
        Ok(jobs) => Json(jobs).into_response(),
        Err(err) => error_response(err, "/jobs"),
    }
}

async fn get_job(
    State(manager): State<GuardedDispatchManager>,
    Path(id): Path<String>,
) -> Response {
    match manager.get_job(&id) {
        Ok(job) => Json(job).into_response(),
        Err(err) => error_response(err, "/job/{id}"),
    }
}

async fn stop_job(
    State(manager): State<GuardedDispatchManager>,
    Path(id): Path<String>,
) -> Response {
    match manager.cancel_job(&id) {
        Ok(_) => status_ok(),
        Err(err) => error_response(err, "/job/{id}/stop"),
    }
}

async fn get_job_events(
    State(manager): State<GuardedDispatchManager>,
    Path(id): Path<String>,
) -> Response {
    match manager.list_events(&id) {
        Ok(events) => Json(events).into_response(),
        Err(err) => error_response(err, "/job/{id}/events"),
    }
}

/// Hands out at most one job, as a list so "no work" is simply `[]`.
async fn get_work(
    State(manager): State<GuardedDispatchManager>,
    Query(worker): Query<WorkerInfo>,
) -> Response {
    match manager.claim_next_job(&worker) {
        Ok(work) => Json(work.into_iter().collect::<Vec<_>>()).into_response(),
        Err(err) => error_response(err, "/work"),
    }
}

async fn peek_work(State(manager): State<GuardedDispatchManager>) -> Response {
    match manager.peek_next_job() {
        Ok(work) => Json(work.into_iter().collect::<Vec<_>>()).into_response(),
        Err(err) => error_response(err, "/work/peek"),
    }
}

async fn heartbeat(
    State(manager): State<GuardedDispatchManager>,
    Path(id): Path<String>,
    Query(worker): Query<WorkerInfo>,
) -> Response {
    match manager.heartbeat(&id, &worker) {
        Ok(()) => status_ok(),
        Err(err) => error_response(err, "/heartbeat/{id}"),
    }
}

async fn progress(
    State(manager): State<GuardedDispatchManager>,
    Json(webhook): Json<WebhookPayload>,
) -> Response {
    match manager.report_progress(&webhook) {
        Ok(_) => status_ok(),
        Err(err) => error_response(err, "/progress"),
    }
}

async fn complete(
    State(manager): State<GuardedDispatchManager>,
    Json(webhook): Json<WebhookPayload>,
) -> Response {
    match manager.report_complete(&webhook) {
        Ok(_) => status_ok(),
        Err(err) => error_response(err, "/complete"),
    }
}

async fn fail(
    State(manager): State<GuardedDispatchManager>,
    Json(webhook): Json<WebhookPayload>,
) -> Response {
    match manager.report_failure(&webhook) {
        Ok(_) => status_ok(),
        Err(err) => error_response(err, "/fail"),
    }
}

pub fn make_job_routes(state: ServerState) -> Router {
    Router::new()
        .route("/job", post(create_job))
        .route("/jobs", get(list_jobs))
        .route("/job/{id}", get(get_job))
        .route("/job/{id}/stop", post(stop_job))
        .route("/job/{id}/events", get(get_job_events))
        .route("/work", get(get_work))
        .route("/work/peek", get(peek_work))
        .route("/heartbeat/{id}", post(heartbeat))
        .route("/progress", post(progress))
        .route("/complete", post(complete))
        .route("/fail", post(fail))
        .with_state(state)
}
