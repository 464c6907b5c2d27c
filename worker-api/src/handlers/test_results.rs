use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use http_auth::WorkerIdentity;
use http_common::{BoxRequestError, RequestError};
use thiserror::Error;
use tracing::{instrument, warn};
use types::{TBState, Test};
use uuid::Uuid;

use crate::ApiState;

#[derive(Debug, Error)]
enum SubmitTestError {
    #[error("decoding json: {0}")]
    MalformedBody(serde_json::Error),

    #[error("run {0} does not exist")]
    UnknownRun(Uuid),

    #[error("cannot submit test for finished run")]
    RunFinished,

    #[error("adding test: {0}")]
    Store(results_db::Error),
}

impl RequestError for SubmitTestError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::MalformedBody(_) | Self::UnknownRun(_) | Self::RunFinished => {
                StatusCode::BAD_REQUEST
            }
            Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Ingest one test result against its run.
///
/// The run must still be open; the store re-checks that in the insert
/// transaction. On a failed result an alert dispatch is detached from the
/// request: the response never waits on sink delivery.
#[instrument(skip_all, fields(worker = %identity), err)]
pub(crate) async fn submit_test(
    State(state): State<ApiState>,
    identity: WorkerIdentity,
    body: Bytes,
) -> Result<(StatusCode, Json<Test>), BoxRequestError> {
    let test: Test = serde_json::from_slice(&body).map_err(SubmitTestError::MalformedBody)?;

    let run = state
        .db()
        .get_run(test.run_id)
        .await
        .map_err(|err| match err {
            results_db::Error::NotFound => SubmitTestError::UnknownRun(test.run_id),
            err => SubmitTestError::Store(err),
        })?;
    if run.is_finished() {
        return Err(SubmitTestError::RunFinished.into());
    }

    state.db().add_test(&test).await.map_err(|err| match err {
        results_db::Error::NotFound => SubmitTestError::UnknownRun(test.run_id),
        results_db::Error::RunFinished(_) => SubmitTestError::RunFinished,
        err => SubmitTestError::Store(err),
    })?;

    if test.result.state() == TBState::Failed {
        let alerts = state.alerts();
        let test = test.clone();
        tokio::spawn(async move {
            if let Err(err) = alerts.fire(run, test).await {
                warn!(error = %err, "failed to fire alert");
            }
        });
    }

    Ok((StatusCode::ACCEPTED, Json(test)))
}

#[derive(Debug, Error)]
enum GetTestError {
    #[error("test {0:?} not found")]
    NotFound(String),

    #[error("getting test: {0}")]
    Store(results_db::Error),
}

impl RequestError for GetTestError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[instrument(skip_all, err)]
pub(crate) async fn get_test(
    State(state): State<ApiState>,
    _identity: WorkerIdentity,
    Path(test_id): Path<String>,
) -> Result<Json<Test>, BoxRequestError> {
    let id =
        Uuid::parse_str(&test_id).map_err(|_| GetTestError::NotFound(test_id.clone()))?;

    let test = state.db().get_test(id).await.map_err(|err| match err {
        results_db::Error::NotFound => GetTestError::NotFound(test_id),
        err => GetTestError::Store(err),
    })?;
    Ok(Json(test))
}

#[derive(Debug, Error)]
#[error("listing tests: {0}")]
struct ListTestsError(results_db::Error);

impl RequestError for ListTestsError {
    fn status_code(&self) -> StatusCode {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

#[instrument(skip_all, err)]
pub(crate) async fn list_tests(
    State(state): State<ApiState>,
    _identity: WorkerIdentity,
) -> Result<Json<Vec<Test>>, BoxRequestError> {
    let tests = state.db().list_tests(0).await.map_err(ListTestsError)?;
    Ok(Json(tests))
}
