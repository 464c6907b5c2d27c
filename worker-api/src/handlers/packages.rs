use axum::{
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Json, Response},
};
use http_auth::WorkerIdentity;
use http_common::{BoxRequestError, RequestError};
use thiserror::Error;
use tracing::{instrument, warn};
use types::Package;

use crate::ApiState;

#[derive(Debug, Error)]
#[error("package {0} not found")]
struct PackageNotFound(String);

impl RequestError for PackageNotFound {
    fn status_code(&self) -> StatusCode {
        StatusCode::NOT_FOUND
    }
}

#[instrument(skip_all, err)]
pub(crate) async fn get_package(
    State(state): State<ApiState>,
    _identity: WorkerIdentity,
    Path(package_name): Path<String>,
) -> Result<Json<Package>, BoxRequestError> {
    let pkg = state
        .packages()
        .get(&package_name)
        .ok_or(PackageNotFound(package_name))?;
    Ok(Json(pkg.clone()))
}

/// Serve the raw bytes of the package's artifact.
///
/// An artifact that has gone missing from disk is indistinguishable from an
/// unknown package to the worker.
#[instrument(skip_all, err)]
pub(crate) async fn download_package(
    State(state): State<ApiState>,
    _identity: WorkerIdentity,
    Path(package_name): Path<String>,
) -> Result<Response, BoxRequestError> {
    let pkg = state
        .packages()
        .get(&package_name)
        .ok_or_else(|| PackageNotFound(package_name.clone()))?;

    let bytes = tokio::fs::read(&pkg.path).await.map_err(|err| {
        warn!(package = %pkg.name, path = %pkg.path.display(), error = %err, "failed to read artifact");
        PackageNotFound(package_name)
    })?;

    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    )
        .into_response())
}
