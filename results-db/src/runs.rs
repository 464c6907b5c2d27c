//! Run lifecycle queries.
//!
//! All state transitions are single guarded `UPDATE`s: the lifecycle
//! precondition lives in the `WHERE` clause, and zero affected rows means
//! the target was missing or not in the required state. That compare-and-set
//! is what makes concurrent claims safe.

use chrono::Utc;
use indoc::indoc;
use sqlx::{Postgres, types::Json};
use types::{Run, RunMeta};
use uuid::Uuid;

use crate::{Error, conn::ConnPool, test_results};

#[derive(Debug, sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    package: String,
    args: Option<Vec<String>>,
    enqueued_at: chrono::DateTime<Utc>,
    started_at: Option<chrono::DateTime<Utc>>,
    finished_at: Option<chrono::DateTime<Utc>>,
    error: Option<String>,
    meta: Json<RunMeta>,
}

impl From<RunRow> for Run {
    fn from(row: RunRow) -> Self {
        Run {
            id: row.id,
            package: row.package,
            args: row.args.unwrap_or_default(),
            enqueued_at: row.enqueued_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            error: row.error,
            meta: row.meta.0,
            tests: Vec::new(),
        }
    }
}

const RUN_COLUMNS: &str = "id, package, args, enqueued_at, started_at, finished_at, error, meta";

pub(crate) async fn insert(pool: &ConnPool, run: &Run) -> Result<(), Error> {
    let query = indoc! {r#"
        INSERT INTO runs (id, package, args, enqueued_at, started_at, finished_at, error, meta)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
    "#};
    sqlx::query(query)
        .bind(run.id)
        .bind(&run.package)
        .bind(&run.args)
        .bind(run.enqueued_at)
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(&run.error)
        .bind(Json(&run.meta))
        .execute(&**pool)
        .await
        .map_err(Error::Database)?;
    Ok(())
}

pub(crate) async fn get(pool: &ConnPool, id: Uuid) -> Result<Run, Error> {
    let mut tx = pool.begin().await.map_err(Error::Database)?;

    let query = format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = $1");
    let row: Option<RunRow> = sqlx::query_as(&query)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?;
    let mut run = Run::from(row.ok_or(Error::NotFound)?);

    run.tests = test_results::fetch_for_runs(&mut *tx, &[id]).await?;

    tx.commit().await.map_err(Error::Database)?;
    Ok(run)
}

pub(crate) async fn start(pool: &ConnPool, id: Uuid, runner: &str) -> Result<(), Error> {
    let query = indoc! {r#"
        UPDATE runs
        SET started_at = $2, meta = $3
        WHERE id = $1 AND started_at IS NULL AND finished_at IS NULL
    "#};
    let res = sqlx::query(query)
        .bind(id)
        .bind(Utc::now())
        .bind(Json(RunMeta {
            runner: Some(runner.to_owned()),
        }))
        .execute(&**pool)
        .await
        .map_err(Error::Database)?;

    if res.rows_affected() == 0 {
        return Err(Error::NotFound);
    }
    Ok(())
}

pub(crate) async fn reset(pool: &ConnPool, id: Uuid) -> Result<(), Error> {
    let query = indoc! {r#"
        UPDATE runs
        SET started_at = NULL, finished_at = NULL, error = NULL, meta = '{}'::jsonb
        WHERE id = $1 AND finished_at IS NULL
    "#};
    let res = sqlx::query(query)
        .bind(id)
        .execute(&**pool)
        .await
        .map_err(Error::Database)?;

    if res.rows_affected() == 0 {
        return Err(Error::NotFound);
    }
    Ok(())
}

pub(crate) async fn complete(pool: &ConnPool, id: Uuid) -> Result<(), Error> {
    let query = indoc! {r#"
        UPDATE runs
        SET finished_at = $2
        WHERE id = $1 AND started_at IS NOT NULL AND finished_at IS NULL
    "#};
    let res = sqlx::query(query)
        .bind(id)
        .bind(Utc::now())
        .execute(&**pool)
        .await
        .map_err(Error::Database)?;

    if res.rows_affected() == 0 {
        return Err(Error::NotFound);
    }
    Ok(())
}

pub(crate) async fn fail(pool: &ConnPool, id: Uuid, error: &str) -> Result<(), Error> {
    let query = indoc! {r#"
        UPDATE runs
        SET finished_at = $2, error = $3
        WHERE id = $1 AND started_at IS NOT NULL AND finished_at IS NULL
    "#};
    let res = sqlx::query(query)
        .bind(id)
        .bind(Utc::now())
        .bind(error)
        .execute(&**pool)
        .await
        .map_err(Error::Database)?;

    if res.rows_affected() == 0 {
        return Err(Error::NotFound);
    }
    Ok(())
}

pub(crate) async fn delete(pool: &ConnPool, id: Uuid) -> Result<(), Error> {
    let mut tx = pool.begin().await.map_err(Error::Database)?;

    sqlx::query("DELETE FROM tests WHERE run_id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

    let res = sqlx::query("DELETE FROM runs WHERE id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;
    if res.rows_affected() == 0 {
        return Err(Error::NotFound);
    }

    tx.commit().await.map_err(Error::Database)?;
    Ok(())
}

pub(crate) async fn list_pending(pool: &ConnPool) -> Result<Vec<Run>, Error> {
    let mut tx = pool.begin().await.map_err(Error::Database)?;

    let query = format!(
        "SELECT {RUN_COLUMNS} FROM runs WHERE finished_at IS NULL ORDER BY enqueued_at ASC"
    );
    let rows: Vec<RunRow> = sqlx::query_as(&query)
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::Database)?;

    let runs = attach_tests(&mut tx, rows).await?;
    tx.commit().await.map_err(Error::Database)?;
    Ok(runs)
}

pub(crate) async fn list_finished(pool: &ConnPool, limit: usize) -> Result<Vec<Run>, Error> {
    let mut tx = pool.begin().await.map_err(Error::Database)?;

    let query = format!(
        "SELECT {RUN_COLUMNS} FROM runs WHERE finished_at IS NOT NULL \
         ORDER BY finished_at DESC LIMIT NULLIF($1::bigint, 0)"
    );
    let rows: Vec<RunRow> = sqlx::query_as(&query)
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::Database)?;

    let runs = attach_tests(&mut tx, rows).await?;
    tx.commit().await.map_err(Error::Database)?;
    Ok(runs)
}

pub(crate) async fn list_for_package(
    pool: &ConnPool,
    package: &str,
    limit: usize,
) -> Result<Vec<Run>, Error> {
    let mut tx = pool.begin().await.map_err(Error::Database)?;

    let query = format!(
        "SELECT {RUN_COLUMNS} FROM runs WHERE package = $1 \
         ORDER BY enqueued_at DESC LIMIT NULLIF($2::bigint, 0)"
    );
    let rows: Vec<RunRow> = sqlx::query_as(&query)
        .bind(package)
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::Database)?;

    let runs = attach_tests(&mut tx, rows).await?;
    tx.commit().await.map_err(Error::Database)?;
    Ok(runs)
}

/// Attach the owned tests of every listed run, in the listing transaction.
async fn attach_tests(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    rows: Vec<RunRow>,
) -> Result<Vec<Run>, Error> {
    let mut runs: Vec<Run> = rows.into_iter().map(Run::from).collect();

    let run_ids: Vec<Uuid> = runs.iter().map(|run| run.id).collect();
    for test in test_results::fetch_for_runs(&mut **tx, &run_ids).await? {
        if let Some(run) = runs.iter_mut().find(|run| run.id == test.run_id) {
            run.tests.push(test);
        }
    }
    Ok(runs)
}
