//! Test result queries.
//!
//! Tests are append-only: they are written while their parent run is
//! started and never mutated afterwards. Reads are ordered by the embedded
//! result's start time, oldest first.

use chrono::{DateTime, Utc};
use indoc::indoc;
use sqlx::{Postgres, types::Json};
use types::{T, TBLog, Test};
use uuid::Uuid;

use crate::{Error, conn::ConnPool};

#[derive(Debug, sqlx::FromRow)]
struct TestRow {
    id: Uuid,
    package: String,
    run_id: Uuid,
    result: Json<T>,
    logs: Json<Vec<TBLog>>,
}

impl From<TestRow> for Test {
    fn from(row: TestRow) -> Self {
        Test {
            id: row.id,
            package: row.package,
            run_id: row.run_id,
            result: row.result.0,
            logs: row.logs.0,
        }
    }
}

const TEST_COLUMNS: &str = "id, package, run_id, result, logs";

/// Insert a test row, guarding the parent run in the same transaction.
///
/// The run must exist and must not be finished; the guard prevents orphan
/// rows and enforces that a finished run's test set is immutable. Duplicate
/// submissions by id are accepted and ignored, which keeps at-least-once
/// ingest idempotent.
pub(crate) async fn insert(pool: &ConnPool, test: &Test) -> Result<(), Error> {
    let mut tx = pool.begin().await.map_err(Error::Database)?;

    let finished_at: Option<Option<DateTime<Utc>>> =
        sqlx::query_scalar("SELECT finished_at FROM runs WHERE id = $1")
            .bind(test.run_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(Error::Database)?;
    match finished_at {
        None => return Err(Error::NotFound),
        Some(Some(_)) => return Err(Error::RunFinished(test.run_id)),
        Some(None) => {}
    }

    let query = indoc! {r#"
        INSERT INTO tests (id, package, run_id, result, logs)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (id) DO NOTHING
    "#};
    sqlx::query(query)
        .bind(test.id)
        .bind(&test.package)
        .bind(test.run_id)
        .bind(Json(&test.result))
        .bind(Json(&test.logs))
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

    tx.commit().await.map_err(Error::Database)?;
    Ok(())
}

pub(crate) async fn get(pool: &ConnPool, id: Uuid) -> Result<Test, Error> {
    let query = format!("SELECT {TEST_COLUMNS} FROM tests WHERE id = $1");
    let row: Option<TestRow> = sqlx::query_as(&query)
        .bind(id)
        .fetch_optional(&**pool)
        .await
        .map_err(Error::Database)?;
    row.map(Test::from).ok_or(Error::NotFound)
}

pub(crate) async fn list(pool: &ConnPool, limit: usize) -> Result<Vec<Test>, Error> {
    let query = format!(
        "SELECT {TEST_COLUMNS} FROM tests \
         ORDER BY result->'started_at' ASC LIMIT NULLIF($1::bigint, 0)"
    );
    let rows: Vec<TestRow> = sqlx::query_as(&query)
        .bind(limit as i64)
        .fetch_all(&**pool)
        .await
        .map_err(Error::Database)?;
    Ok(rows.into_iter().map(Test::from).collect())
}

pub(crate) async fn list_for_package(
    pool: &ConnPool,
    package: &str,
    limit: usize,
) -> Result<Vec<Test>, Error> {
    let query = format!(
        "SELECT {TEST_COLUMNS} FROM tests WHERE package = $1 \
         ORDER BY result->'started_at' ASC LIMIT NULLIF($2::bigint, 0)"
    );
    let rows: Vec<TestRow> = sqlx::query_as(&query)
        .bind(package)
        .bind(limit as i64)
        .fetch_all(&**pool)
        .await
        .map_err(Error::Database)?;
    Ok(rows.into_iter().map(Test::from).collect())
}

pub(crate) async fn list_for_package_in_range(
    pool: &ConnPool,
    package: &str,
    begin: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<Test>, Error> {
    let query = format!(
        "SELECT {TEST_COLUMNS} FROM tests \
         WHERE package = $1 \
           AND (result->>'started_at')::timestamptz >= $2 \
           AND (result->>'started_at')::timestamptz <= $3 \
         ORDER BY result->'started_at' ASC"
    );
    let rows: Vec<TestRow> = sqlx::query_as(&query)
        .bind(package)
        .bind(begin)
        .bind(end)
        .fetch_all(&**pool)
        .await
        .map_err(Error::Database)?;
    Ok(rows.into_iter().map(Test::from).collect())
}

/// Fetch all tests belonging to the given runs, ordered by start time.
pub(crate) async fn fetch_for_runs<'c, E>(exe: E, run_ids: &[Uuid]) -> Result<Vec<Test>, Error>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    if run_ids.is_empty() {
        return Ok(Vec::new());
    }

    let query = format!(
        "SELECT {TEST_COLUMNS} FROM tests WHERE run_id = ANY($1) \
         ORDER BY result->'started_at' ASC"
    );
    let rows: Vec<TestRow> = sqlx::query_as(&query)
        .bind(run_ids)
        .fetch_all(exe)
        .await
        .map_err(Error::Database)?;
    Ok(rows.into_iter().map(Test::from).collect())
}
