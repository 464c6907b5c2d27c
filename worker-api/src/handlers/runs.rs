use std::collections::HashSet;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use http_auth::WorkerIdentity;
use http_common::{BoxRequestError, RequestError};
use serde::Deserialize;
use thiserror::Error;
use tracing::instrument;
use types::Run;
use uuid::Uuid;

use crate::ApiState;

#[derive(Debug, Deserialize)]
pub(crate) struct ClaimRunRequest {
    #[serde(default)]
    package_whitelist: Vec<String>,
    #[serde(default)]
    package_blacklist: Vec<String>,
}

#[derive(Debug, Error)]
enum ClaimRunError {
    #[error("decoding json: {0}")]
    MalformedBody(serde_json::Error),

    #[error("no runs for packages: {}", packages.join(", "))]
    NoMatchingRuns { packages: Vec<String> },

    #[error("claiming run: {0}")]
    Store(results_db::Error),
}

impl RequestError for ClaimRunError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::MalformedBody(_) => StatusCode::BAD_REQUEST,
            Self::NoMatchingRuns { .. } => StatusCode::NOT_FOUND,
            Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Hand the oldest matching pending run to the calling worker.
///
/// Candidates are scanned oldest-enqueued first; each passing the package
/// filter is claimed with the store's compare-and-set. Losing the race on
/// one candidate just moves the scan to the next, so at most one caller
/// ever receives a given run. The blacklist dominates the whitelist.
#[instrument(skip_all, fields(worker = %identity), err)]
pub(crate) async fn claim_run(
    State(state): State<ApiState>,
    identity: WorkerIdentity,
    body: Bytes,
) -> Result<Json<Run>, BoxRequestError> {
    let request: ClaimRunRequest =
        serde_json::from_slice(&body).map_err(ClaimRunError::MalformedBody)?;

    let packages: Vec<String> = if request.package_whitelist.is_empty() {
        state.packages().keys().cloned().collect()
    } else {
        request.package_whitelist
    };
    let supported: HashSet<&str> = packages.iter().map(String::as_str).collect();
    let unsupported: HashSet<&str> = request
        .package_blacklist
        .iter()
        .map(String::as_str)
        .collect();

    let pending = state
        .db()
        .list_pending_runs()
        .await
        .map_err(ClaimRunError::Store)?;

    for run in pending {
        if run.is_started() {
            continue;
        }
        if unsupported.contains(run.package.as_str()) {
            continue;
        }
        if !supported.contains(run.package.as_str()) {
            continue;
        }

        match state.db().start_run(run.id, identity.as_str()).await {
            Ok(()) => {
                // Re-read so the worker sees its own identity and the start
                // timestamp.
                let claimed = state
                    .db()
                    .get_run(run.id)
                    .await
                    .map_err(ClaimRunError::Store)?;
                return Ok(Json(claimed));
            }
            // Another claimer won this run; try the next candidate.
            Err(results_db::Error::NotFound) => continue,
            Err(err) => return Err(ClaimRunError::Store(err).into()),
        }
    }

    Err(ClaimRunError::NoMatchingRuns { packages }.into())
}

#[derive(Debug, Error)]
enum FinishRunError {
    #[error("run {0:?} not found")]
    NotFound(String),

    #[error("decoding json: {0}")]
    MalformedBody(serde_json::Error),

    #[error("cannot {verb} already finished run")]
    AlreadyFinished { verb: &'static str },

    #[error("cannot {verb} run that has not started")]
    NotStarted { verb: &'static str },

    #[error("finishing run: {0}")]
    Store(results_db::Error),
}

impl RequestError for FinishRunError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::MalformedBody(_) | Self::AlreadyFinished { .. } | Self::NotStarted { .. } => {
                StatusCode::BAD_REQUEST
            }
            Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Look the run up first so a double-posting worker gets a crisp error
/// instead of a silent success; the store's guarded update is what actually
/// enforces the transition.
async fn checked_run_id(state: &ApiState, raw_id: &str, verb: &'static str) -> Result<Uuid, FinishRunError> {
    let id = Uuid::parse_str(raw_id).map_err(|_| FinishRunError::NotFound(raw_id.to_owned()))?;

    let run = state.db().get_run(id).await.map_err(|err| match err {
        results_db::Error::NotFound => FinishRunError::NotFound(raw_id.to_owned()),
        err => FinishRunError::Store(err),
    })?;
    if run.is_finished() {
        return Err(FinishRunError::AlreadyFinished { verb });
    }
    Ok(id)
}

fn map_finish_error(err: results_db::Error, verb: &'static str) -> FinishRunError {
    match err {
        // The guarded update found no started, unfinished run: either the
        // worker never claimed it, or it finished since the check above.
        results_db::Error::NotFound => FinishRunError::NotStarted { verb },
        err => FinishRunError::Store(err),
    }
}

#[instrument(skip_all, fields(worker = %identity, run = %run_id), err)]
pub(crate) async fn complete_run(
    State(state): State<ApiState>,
    identity: WorkerIdentity,
    Path(run_id): Path<String>,
) -> Result<StatusCode, BoxRequestError> {
    let id = checked_run_id(&state, &run_id, "complete").await?;

    state
        .db()
        .complete_run(id)
        .await
        .map_err(|err| map_finish_error(err, "complete"))?;
    Ok(StatusCode::OK)
}

#[instrument(skip_all, fields(worker = %identity, run = %run_id), err)]
pub(crate) async fn fail_run(
    State(state): State<ApiState>,
    identity: WorkerIdentity,
    Path(run_id): Path<String>,
    body: Bytes,
) -> Result<StatusCode, BoxRequestError> {
    let id = checked_run_id(&state, &run_id, "fail").await?;

    // The body is a JSON-encoded string carrying the error message.
    let error_message: String =
        serde_json::from_slice(&body).map_err(FinishRunError::MalformedBody)?;

    state
        .db()
        .fail_run(id, &error_message)
        .await
        .map_err(|err| map_finish_error(err, "fail"))?;
    Ok(StatusCode::OK)
}
