//! Provisioned test databases
//!
//! A [`TestDatabase`] is a database that already exists with its schema
//! applied, plus a connection pool bound to the calling runtime. Sessions and
//! raw transactions are handed out through callbacks so their rollback runs
//! on every exit path.

use futures::future::LocalBoxFuture;
use pg_provision::{connect_pool, ConnectionDescriptor, PoolConfig};
use sqlx::{Connection, PgPool, Postgres, Transaction};
use tracing::debug;

use crate::error::FixtureError;
use crate::scope::{finish, guarded, Teardown};
use crate::session::DbSession;

/// A provisioned database and the pool tests draw connections from
#[derive(Debug, Clone)]
pub struct TestDatabase {
    descriptor: ConnectionDescriptor,
    pool: PgPool,
}

impl TestDatabase {
    /// Opens a pool to an already provisioned database
    pub async fn connect(
        descriptor: ConnectionDescriptor,
        config: &PoolConfig,
    ) -> Result<Self, FixtureError> {
        let pool = connect_pool(&descriptor, config).await?;
        Ok(Self { descriptor, pool })
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    /// Database name on the server
    pub fn name(&self) -> &str {
        self.descriptor.database()
    }

    /// Returns a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs `body` with a session whose work is rolled back afterwards
    ///
    /// The session is opened on a fresh connection inside a new top-level
    /// transaction. Whatever `body` does, including committing through the
    /// session or through nested transactions, teardown then:
    ///
    /// 1. closes the session, discarding its uncommitted work
    /// 2. rolls back the outer transaction
    /// 3. closes the connection
    ///
    /// Every step runs even if an earlier one failed. A panic in `body` is
    /// resumed after teardown.
    ///
    /// # Errors
    ///
    /// `FixtureError::Body` if `body` fails, `FixtureError::Connection` if the
    /// session cannot be opened, `FixtureError::Teardown` for the first
    /// failed teardown step
    pub async fn with_session<T, F>(&self, body: F) -> Result<T, FixtureError>
    where
        F: for<'s> FnOnce(&'s mut DbSession<'_>) -> LocalBoxFuture<'s, anyhow::Result<T>>,
    {
        let mut conn = self.pool.acquire().await.map_err(FixtureError::Connection)?;
        // On failure the connection goes back to the pool when dropped
        let tx = conn.begin().await.map_err(FixtureError::Connection)?;
        let mut teardown = Teardown::default();

        let mut session = DbSession::new(tx);
        let outcome = match session.open().await {
            Ok(()) => Ok(guarded(body(&mut session)).await),
            Err(error) => Err(error),
        };

        let (tx, closed) = session.close().await;
        teardown.record_sql("close session", closed);
        teardown.record_sql("rollback", tx.rollback().await);
        teardown.record_sql("close connection", conn.close().await);
        debug!(database = self.name(), clean = teardown.is_clean(), "Session torn down");

        finish(outcome.map_err(FixtureError::Connection)?, teardown)
    }

    /// Runs `body` with the raw outer transaction, rolled back afterwards
    ///
    /// Same guarantees as [`with_session`](Self::with_session), for callers
    /// that want plain `sqlx` access without the session savepoint.
    pub async fn with_transaction<T, F>(&self, body: F) -> Result<T, FixtureError>
    where
        F: for<'t> FnOnce(
            &'t mut Transaction<'_, Postgres>,
        ) -> LocalBoxFuture<'t, anyhow::Result<T>>,
    {
        let mut conn = self.pool.acquire().await.map_err(FixtureError::Connection)?;
        // On failure the connection goes back to the pool when dropped
        let mut tx = conn.begin().await.map_err(FixtureError::Connection)?;
        let mut teardown = Teardown::default();

        let outcome = guarded(body(&mut tx)).await;

        teardown.record_sql("rollback", tx.rollback().await);
        teardown.record_sql("close connection", conn.close().await);
        debug!(database = self.name(), clean = teardown.is_clean(), "Transaction torn down");

        finish(outcome, teardown)
    }

    /// Closes the pool, waiting for checked-out connections to return
    pub async fn close(self) {
        self.pool.close().await;
    }
}
