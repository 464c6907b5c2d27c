//! On-demand time-bucketed aggregation over finished runs and their tests.
//!
//! The result is a dense vector: one [`RunSummary`] per window-sized bucket
//! between `begin` and `end`, present even when empty. One query joins tests
//! to their finished parent runs; each row is placed by the run's start
//! time. Because a run is joined to each of its tests, run ids are collected
//! blindly and uniquified afterwards, preserving first-occurrence order.

use std::{collections::HashSet, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use indoc::indoc;
use sqlx::types::Json;
use types::{PackageSummary, RunSummary, T};
use uuid::Uuid;

use crate::{Error, conn::ConnPool};

#[derive(Debug, sqlx::FromRow)]
struct SummaryRow {
    package: String,
    run_id: Uuid,
    started_at: DateTime<Utc>,
    error: Option<String>,
    test_id: Uuid,
    result: Json<T>,
}

pub(crate) async fn list_in_range(
    pool: &ConnPool,
    begin: DateTime<Utc>,
    end: DateTime<Utc>,
    window: Duration,
) -> Result<Vec<RunSummary>, Error> {
    let window_nanos = i64::try_from(window.as_nanos()).unwrap_or(i64::MAX);
    let span_nanos = (end - begin).num_nanoseconds().unwrap_or(i64::MAX);
    if window_nanos <= 0 || span_nanos <= 0 {
        return Ok(Vec::new());
    }

    let bucket_count =
        usize::try_from((span_nanos + window_nanos - 1) / window_nanos).unwrap_or(0);
    let mut summaries: Vec<RunSummary> = (0..bucket_count)
        .map(|i| {
            let time = begin + TimeDelta::nanoseconds(window_nanos * i as i64);
            RunSummary::new(time, window)
        })
        .collect();

    let query = indoc! {r#"
        SELECT runs.package, runs.id AS run_id, runs.started_at, runs.error,
               tests.id AS test_id, tests.result
        FROM tests
        JOIN runs ON tests.run_id = runs.id
        WHERE runs.started_at IS NOT NULL
          AND runs.started_at >= $1
          AND runs.started_at <= $2
          AND runs.finished_at IS NOT NULL
        ORDER BY runs.started_at ASC
    "#};
    let rows: Vec<SummaryRow> = sqlx::query_as(query)
        .bind(begin)
        .bind(end)
        .fetch_all(&**pool)
        .await
        .map_err(Error::Database)?;

    for row in rows {
        let bucket_nanos = (row.started_at - begin).num_nanoseconds().unwrap_or(0);
        // A run starting exactly at `end` lands in the final bucket.
        let bucket = usize::try_from(bucket_nanos / window_nanos)
            .unwrap_or(0)
            .min(bucket_count - 1);

        let package_summary = summaries[bucket]
            .package_summary
            .entry(row.package.clone())
            .or_insert_with(|| PackageSummary::new(&row.package));

        if row.error.is_some() {
            // The run failed outright; its test rows carry no signal.
            package_summary.error_run_ids.push(row.run_id);
            continue;
        }
        package_summary.run_ids.push(row.run_id);
        package_summary.record_test(&row.result.0.name, row.result.0.state(), row.test_id);
    }

    for summary in &mut summaries {
        for package_summary in summary.package_summary.values_mut() {
            dedupe_preserving_order(&mut package_summary.run_ids);
            dedupe_preserving_order(&mut package_summary.error_run_ids);
        }
    }

    Ok(summaries)
}

fn dedupe_preserving_order(ids: &mut Vec<Uuid>) {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.retain(|id| seen.insert(*id));
}
