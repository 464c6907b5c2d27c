//! Failure alert fan-out.
//!
//! When a worker submits a failed test the dispatcher hands an [`Alert`] to
//! the [`AlertManager`], which fires every registered sink concurrently.
//! Delivery is best-effort: every sink is attempted even when one fails, no
//! retries are performed, and dispatch is detached from the originating
//! request so a slow sink never delays a reply.

use std::sync::Arc;

use async_trait::async_trait;
use types::{Run, Test};

mod slack;

pub use self::slack::{SlackAlerter, SlackAlerterConfig};

/// A failed test together with the run it belongs to.
#[derive(Debug, Clone)]
pub struct Alert {
    pub run: Run,
    pub test: Test,
    /// Base URL of the dashboard, used by sinks to link to the failure.
    pub base_url: String,
}

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A sink failure alerts are delivered to.
///
/// Sinks are expected to be idempotent or best-effort; the manager performs
/// no retries.
#[async_trait]
pub trait Alerter: Send + Sync {
    async fn fire(&self, alert: &Alert) -> Result<(), BoxError>;
}

/// Combined outcome of a fan-out where at least one sink failed.
///
/// All sinks were still attempted; only the first failure is carried as the
/// source.
#[derive(Debug, thiserror::Error)]
#[error("firing alerts: {failed} of {attempted} alerters failed: {first}")]
pub struct DeliveryError {
    pub attempted: usize,
    pub failed: usize,
    #[source]
    first: BoxError,
}

/// Fans alerts out to every registered [`Alerter`] concurrently.
#[derive(Default)]
pub struct AlertManager {
    base_url: String,
    alerters: Vec<Arc<dyn Alerter>>,
}

impl AlertManager {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            alerters: Vec::new(),
        }
    }

    pub fn register_alerter(&mut self, alerter: Arc<dyn Alerter>) {
        self.alerters.push(alerter);
    }

    /// Fire `alert` on every registered sink, concurrently.
    ///
    /// Joins on all sinks; the first error is reported after every sink has
    /// been attempted.
    pub async fn fire(&self, run: Run, test: Test) -> Result<(), DeliveryError> {
        let alert = Alert {
            run,
            test,
            base_url: self.base_url.clone(),
        };

        let attempts = self.alerters.iter().map(|alerter| alerter.fire(&alert));
        let outcomes = futures::future::join_all(attempts).await;

        let attempted = outcomes.len();
        let mut failures = outcomes.into_iter().filter_map(Result::err);
        match failures.next() {
            None => Ok(()),
            Some(first) => Err(DeliveryError {
                attempted,
                failed: 1 + failures.count(),
                first,
            }),
        }
    }
}
