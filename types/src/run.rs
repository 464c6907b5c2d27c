use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Test;

/// One scheduled execution attempt of a package.
///
/// A run moves through a strict linear lifecycle: enqueued, started by the
/// worker that claims it, then completed or failed. The scheduler may move a
/// started run back to enqueued if its worker goes silent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub package: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Present iff the run ended in failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub meta: RunMeta,
    /// Tests submitted against this run. Owned: deleting the run deletes
    /// them.
    #[serde(default)]
    pub tests: Vec<Test>,
}

impl Run {
    /// A fresh run for `package`, enqueued now.
    pub fn new(package: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            package: package.into(),
            args,
            enqueued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
            meta: RunMeta::default(),
            tests: Vec::new(),
        }
    }

    /// Not yet finished, whether or not a worker holds it.
    pub fn is_pending(&self) -> bool {
        self.finished_at.is_none()
    }

    pub fn is_started(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}

/// Worker-identity metadata bound to a run when it is claimed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner: Option<String>,
}
