use std::{collections::HashMap, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::TBState;

/// Aggregated outcomes for one fixed-width time bucket.
///
/// Summaries are computed on demand for dashboard reads and never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Start of the bucket.
    pub time: DateTime<Utc>,
    /// Width of the bucket.
    pub duration: Duration,
    pub package_summary: HashMap<String, PackageSummary>,
}

impl RunSummary {
    pub fn new(time: DateTime<Utc>, duration: Duration) -> Self {
        Self {
            time,
            duration,
            package_summary: HashMap::new(),
        }
    }
}

/// Per-package breakdown within one summary bucket: run ids partitioned into
/// ok and errored, and test ids partitioned by terminal state per test name.
#[derive(Debug, Clone, Serialize)]
pub struct PackageSummary {
    pub package: String,
    pub run_ids: Vec<Uuid>,
    pub error_run_ids: Vec<Uuid>,
    pub passed_tests: HashMap<String, Vec<Uuid>>,
    pub failed_tests: HashMap<String, Vec<Uuid>>,
    pub skipped_tests: HashMap<String, Vec<Uuid>>,
}

impl PackageSummary {
    pub fn new(package: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            run_ids: Vec::new(),
            error_run_ids: Vec::new(),
            passed_tests: HashMap::new(),
            failed_tests: HashMap::new(),
            skipped_tests: HashMap::new(),
        }
    }

    /// Record one test outcome under its name.
    pub fn record_test(&mut self, name: &str, state: TBState, id: Uuid) {
        let tests = match state {
            TBState::Passed => &mut self.passed_tests,
            TBState::Failed => &mut self.failed_tests,
            TBState::Skipped => &mut self.skipped_tests,
        };
        tests.entry(name.to_owned()).or_default().push(id);
    }

    /// Total number of runs in the bucket, ok and errored.
    pub fn total_runs(&self) -> usize {
        self.run_ids.len() + self.error_run_ids.len()
    }

    /// Fraction of runs that errored, 0 when the bucket holds no runs.
    pub fn error_rate(&self) -> f64 {
        ratio(self.error_run_ids.len(), self.total_runs())
    }

    /// Number of recorded outcomes for the named test across all states.
    pub fn test_total(&self, name: &str) -> usize {
        [&self.passed_tests, &self.failed_tests, &self.skipped_tests]
            .iter()
            .map(|tests| tests.get(name).map_or(0, Vec::len))
            .sum()
    }

    /// Fraction of the named test's outcomes that passed, 0 when it never
    /// ran in the bucket.
    pub fn test_pass_rate(&self, name: &str) -> f64 {
        let passed = self.passed_tests.get(name).map_or(0, Vec::len);
        ratio(passed, self.test_total(name))
    }
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    part as f64 / whole as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rates_are_zero_for_empty_summaries() {
        let summary = PackageSummary::new("pkg");
        assert_eq!(summary.total_runs(), 0);
        assert_eq!(summary.error_rate(), 0.0);
        assert_eq!(summary.test_pass_rate("t"), 0.0);
    }

    #[test]
    fn test_outcomes_partition_by_state() {
        let mut summary = PackageSummary::new("pkg");
        summary.record_test("t", TBState::Passed, Uuid::new_v4());
        summary.record_test("t", TBState::Passed, Uuid::new_v4());
        summary.record_test("t", TBState::Failed, Uuid::new_v4());
        summary.record_test("t", TBState::Skipped, Uuid::new_v4());

        assert_eq!(summary.test_total("t"), 4);
        assert_eq!(summary.test_pass_rate("t"), 0.5);
        assert_eq!(summary.passed_tests["t"].len(), 2);
        assert_eq!(summary.failed_tests["t"].len(), 1);
        assert_eq!(summary.skipped_tests["t"].len(), 1);
    }

    #[test]
    fn error_rate_counts_errored_runs() {
        let mut summary = PackageSummary::new("pkg");
        summary.run_ids.push(Uuid::new_v4());
        summary.run_ids.push(Uuid::new_v4());
        summary.run_ids.push(Uuid::new_v4());
        summary.error_run_ids.push(Uuid::new_v4());

        assert_eq!(summary.total_runs(), 4);
        assert_eq!(summary.error_rate(), 0.25);
    }
}
