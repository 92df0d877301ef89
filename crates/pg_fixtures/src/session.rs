//! Rollback-isolated database sessions
//!
//! A [`DbSession`] lives inside a top-level transaction that is always rolled
//! back when the test finishes. The session keeps its own savepoint on top of
//! that transaction: [`commit`](DbSession::commit) releases it and opens a new
//! one, so committed work stays visible for the rest of the test but never
//! outlives it.

use sqlx::{Connection, PgConnection, Postgres, Transaction};
use std::ops::{Deref, DerefMut};
use tracing::debug;

const SESSION_SAVEPOINT: &str = "pg_fixtures_session";

/// A database session bound to one connection and one outer transaction
///
/// Dereferences to the underlying `PgConnection`, so queries run through it
/// directly:
///
/// ```rust,ignore
/// env.with_session(|session| Box::pin(async move {
///     sqlx::query("INSERT INTO table1 (id, descr) VALUES (1, 'a')")
///         .execute(&mut **session)
///         .await?;
///     session.commit().await?;
///     Ok(())
/// }))
/// .await?;
/// ```
pub struct DbSession<'c> {
    tx: Transaction<'c, Postgres>,
    savepoint_open: bool,
    commits: u32,
}

impl<'c> DbSession<'c> {
    pub(crate) fn new(tx: Transaction<'c, Postgres>) -> Self {
        Self {
            tx,
            savepoint_open: false,
            commits: 0,
        }
    }

    /// Opens the session savepoint
    pub(crate) async fn open(&mut self) -> Result<(), sqlx::Error> {
        self.savepoint("SAVEPOINT").await?;
        self.savepoint_open = true;
        Ok(())
    }

    /// Makes the session's work visible to the rest of the test
    ///
    /// Only the session savepoint is released; the outer transaction stays
    /// open and is still rolled back at teardown. Values the caller already
    /// read are unaffected.
    pub async fn commit(&mut self) -> Result<(), sqlx::Error> {
        if self.savepoint_open {
            self.savepoint_open = false;
            self.savepoint("RELEASE SAVEPOINT").await?;
        }
        self.open().await?;
        self.commits += 1;
        debug!(commits = self.commits, "Session committed");
        Ok(())
    }

    /// Discards the session's work since the last commit
    pub async fn rollback(&mut self) -> Result<(), sqlx::Error> {
        if self.savepoint_open {
            self.savepoint("ROLLBACK TO SAVEPOINT").await
        } else {
            self.open().await
        }
    }

    /// Opens a nested transaction for code that manages its own transactions
    ///
    /// Committing it releases a savepoint; the outer rollback still discards it.
    pub async fn begin(&mut self) -> Result<Transaction<'_, Postgres>, sqlx::Error> {
        Connection::begin(&mut *self.tx).await
    }

    /// Number of successful [`commit`](Self::commit) calls
    pub fn commits(&self) -> u32 {
        self.commits
    }

    /// Closes the session, discarding uncommitted work, and hands back the
    /// outer transaction with the outcome
    pub(crate) async fn close(mut self) -> (Transaction<'c, Postgres>, Result<(), sqlx::Error>) {
        let result = if self.savepoint_open {
            match self.savepoint("ROLLBACK TO SAVEPOINT").await {
                Ok(()) => self.savepoint("RELEASE SAVEPOINT").await,
                Err(error) => Err(error),
            }
        } else {
            Ok(())
        };
        (self.tx, result)
    }

    async fn savepoint(&mut self, command: &str) -> Result<(), sqlx::Error> {
        let statement = format!("{} {}", command, SESSION_SAVEPOINT);
        sqlx::raw_sql(&statement).execute(&mut *self.tx).await?;
        Ok(())
    }
}

impl Deref for DbSession<'_> {
    type Target = PgConnection;

    fn deref(&self) -> &PgConnection {
        &self.tx
    }
}

impl DerefMut for DbSession<'_> {
    fn deref_mut(&mut self) -> &mut PgConnection {
        &mut self.tx
    }
}
