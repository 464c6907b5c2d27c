//! Internal connection pool to the results DB.

use std::time::Duration;

use sqlx::{Pool, Postgres, migrate::Migrator, postgres::PgPoolOptions};
use tracing::instrument;

use crate::Error;

/// Default connection pool size.
pub const DEFAULT_POOL_SIZE: u32 = 10;

/// A connection pool to the results DB. Clones refer to the same pool.
#[derive(Debug, Clone)]
pub struct ConnPool(Pool<Postgres>);

impl ConnPool {
    /// Set up a connection pool to the results DB.
    #[instrument(skip_all, err)]
    pub async fn connect(url: &str, pool_size: u32) -> Result<Self, Error> {
        PgPoolOptions::new()
            .max_connections(pool_size)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await
            .map(Self)
            .map_err(Error::Connection)
    }

    /// Runs migrations on the database.
    ///
    /// SQLx does the right things:
    /// - Locks the DB before running migrations.
    /// - Never runs the same migration twice.
    /// - Errors on changes to old migrations.
    #[instrument(skip(self), err)]
    pub async fn run_migrations(&self) -> Result<(), Error> {
        static MIGRATOR: Migrator = sqlx::migrate!();
        MIGRATOR.run(&self.0).await.map_err(Error::Migration)
    }
}

impl std::ops::Deref for ConnPool {
    type Target = Pool<Postgres>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
