//! Transactional persistence for runs and their test results.
//!
//! [`ResultsDb`] is the single store contract the scheduler, the worker API,
//! and the dashboard read paths are built on. Every operation is
//! transactional at its own granularity; mutating operations that find no
//! target report [`Error::NotFound`] instead of silently succeeding.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::instrument;
use types::{Run, RunSummary, Test};
use uuid::Uuid;

mod conn;
mod runs;
mod summaries;
mod test_results;

pub use self::conn::DEFAULT_POOL_SIZE;
use self::conn::ConnPool;

/// Errors from results DB operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The targeted row does not exist, or is not in the state the
    /// operation requires (e.g. resetting a finished run).
    #[error("not found")]
    NotFound,

    /// A test was submitted against a run that already finished.
    #[error("run {0} is already finished")]
    RunFinished(Uuid),

    #[error("Error connecting to results db: {0}")]
    Connection(#[source] sqlx::Error),

    #[error("Error running migrations: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    #[error("Error executing database query: {0}")]
    Database(#[source] sqlx::Error),
}

/// Connection pool to the results DB. Clones refer to the same instance.
#[derive(Debug, Clone)]
pub struct ResultsDb {
    pool: ConnPool,
}

impl ResultsDb {
    /// Sets up a connection pool to the results DB and runs migrations.
    ///
    /// Safe to invoke against a freshly-created or already-initialised
    /// database.
    #[instrument(skip_all, err)]
    pub async fn connect(url: &str, pool_size: u32) -> Result<Self, Error> {
        let pool = ConnPool::connect(url, pool_size).await?;
        pool.run_migrations().await?;
        Ok(Self { pool })
    }

    /// Like [`connect`](Self::connect), retrying while the database is still
    /// starting up. Used against just-spawned temporary databases in tests.
    pub async fn connect_with_retry(url: &str, pool_size: u32) -> Result<Self, Error> {
        use backon::{ExponentialBuilder, Retryable};

        let retry_policy = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(10))
            .with_max_delay(Duration::from_millis(100))
            .with_max_times(20);

        (|| Self::connect(url, pool_size))
            .retry(retry_policy)
            .when(is_database_starting_up)
            .await
    }

    /// Insert a single test row.
    ///
    /// The parent run is checked in the same transaction: it must exist and
    /// must not be finished. A duplicate insert by id is a no-op.
    pub async fn add_test(&self, test: &Test) -> Result<(), Error> {
        test_results::insert(&self.pool, test).await
    }

    pub async fn get_test(&self, id: Uuid) -> Result<Test, Error> {
        test_results::get(&self.pool, id).await
    }

    /// List tests ordered by their result's start time, oldest first.
    /// A zero `limit` means no cap.
    pub async fn list_tests(&self, limit: usize) -> Result<Vec<Test>, Error> {
        test_results::list(&self.pool, limit).await
    }

    pub async fn list_tests_for_package(
        &self,
        package: &str,
        limit: usize,
    ) -> Result<Vec<Test>, Error> {
        test_results::list_for_package(&self.pool, package, limit).await
    }

    pub async fn list_tests_for_package_in_range(
        &self,
        package: &str,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Test>, Error> {
        test_results::list_for_package_in_range(&self.pool, package, begin, end).await
    }

    pub async fn enqueue_run(&self, run: &Run) -> Result<(), Error> {
        runs::insert(&self.pool, run).await
    }

    /// Fetch a run with its owned tests attached.
    pub async fn get_run(&self, id: Uuid) -> Result<Run, Error> {
        runs::get(&self.pool, id).await
    }

    /// Atomically transition an enqueued run to started, stamping the start
    /// time and the claiming worker's identity.
    ///
    /// Fails with [`Error::NotFound`] when no enqueued run with this id
    /// exists, in particular when a concurrent claimer won the race. This
    /// is the compare-and-set the claim protocol relies on.
    #[instrument(skip(self), err)]
    pub async fn start_run(&self, id: Uuid, runner: &str) -> Result<(), Error> {
        runs::start(&self.pool, id, runner).await
    }

    /// Atomically transition a started run back to enqueued, clearing its
    /// start time, terminal state, and worker identity.
    ///
    /// Refuses to touch a finished run and reports [`Error::NotFound`] in
    /// that case.
    #[instrument(skip(self), err)]
    pub async fn reset_run(&self, id: Uuid) -> Result<(), Error> {
        runs::reset(&self.pool, id).await
    }

    #[instrument(skip(self), err)]
    pub async fn complete_run(&self, id: Uuid) -> Result<(), Error> {
        runs::complete(&self.pool, id).await
    }

    #[instrument(skip(self, error), err)]
    pub async fn fail_run(&self, id: Uuid, error: &str) -> Result<(), Error> {
        runs::fail(&self.pool, id, error).await
    }

    /// Hard-delete a run and the tests it owns.
    #[instrument(skip(self), err)]
    pub async fn delete_run(&self, id: Uuid) -> Result<(), Error> {
        runs::delete(&self.pool, id).await
    }

    /// All runs that have not finished, oldest-enqueued first, with their
    /// tests attached.
    pub async fn list_pending_runs(&self) -> Result<Vec<Run>, Error> {
        runs::list_pending(&self.pool).await
    }

    /// Finished runs, newest-finished first. A zero `limit` means no cap.
    pub async fn list_finished_runs(&self, limit: usize) -> Result<Vec<Run>, Error> {
        runs::list_finished(&self.pool, limit).await
    }

    pub async fn list_runs_for_package(
        &self,
        package: &str,
        limit: usize,
    ) -> Result<Vec<Run>, Error> {
        runs::list_for_package(&self.pool, package, limit).await
    }

    /// Aggregate finished runs whose start time falls in `[begin, end]` into
    /// dense fixed-width buckets. See [`summaries`] for the contract.
    pub async fn list_run_summaries_in_range(
        &self,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
        window: Duration,
    ) -> Result<Vec<RunSummary>, Error> {
        summaries::list_in_range(&self.pool, begin, end, window).await
    }
}

fn is_database_starting_up(err: &Error) -> bool {
    match err {
        Error::Connection(sqlx::Error::Database(db_err)) => db_err
            .to_string()
            .contains("the database system is starting up"),
        _ => false,
    }
}
