//! The worker-facing HTTP API.
//!
//! Stateless request handlers layered over the results DB: workers claim
//! pending runs, stream test results against them, and terminally complete
//! or fail them. This is the hot path; every state transition delegates its
//! atomicity to the store.

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use alerting::AlertManager;
use axum::{
    Router,
    extract::FromRef,
    routing::{get, post},
};
use http_auth::ApiSecret;
use http_common::BoxError;
use results_db::ResultsDb;
use tokio::sync::broadcast;
use types::Package;

mod handlers;

/// Shared state behind every handler. Clones refer to the same instance.
#[derive(Clone)]
pub struct ApiState(Arc<StateInner>);

struct StateInner {
    db: ResultsDb,
    packages: HashMap<String, Package>,
    alerts: Arc<AlertManager>,
    secret: ApiSecret,
}

impl ApiState {
    pub fn new(
        db: ResultsDb,
        packages: impl IntoIterator<Item = Package>,
        alerts: Arc<AlertManager>,
        secret: ApiSecret,
    ) -> Self {
        let packages = packages
            .into_iter()
            .map(|pkg| (pkg.name.clone(), pkg))
            .collect();
        Self(Arc::new(StateInner {
            db,
            packages,
            alerts,
            secret,
        }))
    }

    fn db(&self) -> &ResultsDb {
        &self.0.db
    }

    fn packages(&self) -> &HashMap<String, Package> {
        &self.0.packages
    }

    fn alerts(&self) -> Arc<AlertManager> {
        Arc::clone(&self.0.alerts)
    }
}

impl FromRef<ApiState> for ApiSecret {
    fn from_ref(state: &ApiState) -> Self {
        state.0.secret.clone()
    }
}

/// Build the worker API router. All routes live under `/api` and are gated
/// on the shared secret.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route(
            "/api/tests",
            post(handlers::submit_test).get(handlers::list_tests),
        )
        .route("/api/tests/{test_id}", get(handlers::get_test))
        .route("/api/runs/claim", post(handlers::claim_run))
        .route("/api/runs/{run_id}/complete", post(handlers::complete_run))
        .route("/api/runs/{run_id}/fail", post(handlers::fail_run))
        .route("/api/packages/{package_name}", get(handlers::get_package))
        .route(
            "/api/packages/{package_name}/download",
            get(handlers::download_package),
        )
        .with_state(state)
}

pub async fn serve(
    addr: SocketAddr,
    state: ApiState,
    shutdown: broadcast::Receiver<()>,
) -> Result<(), BoxError> {
    http_common::serve_at(addr, router(state), shutdown).await
}
