//! PostgreSQL Test Fixtures
//!
//! Gives test suites a real PostgreSQL database without letting tests leak
//! state into each other. A test binary owns one [`TestEnvironment`], which
//! provisions a session-scoped database on first use and drops it at exit.
//! Tests then either borrow a rollback-isolated [`DbSession`] on that
//! database, or ask for a function-scoped database of their own.
//!
//! # Modules
//!
//! - `config`: layered resolution of the fixture settings
//! - `environment`: the `TestEnvironment` fixture surface
//! - `database`: provisioned databases, sessions and raw transactions
//! - `session`: the rollback-isolated `DbSession`
//! - `container`: throwaway PostgreSQL server via testcontainers
//! - `logging`: tracing setup and run abortion
//! - `error`: `FixtureError` and exit codes
//!
//! # Example
//!
//! ```rust,ignore
//! use once_cell::sync::Lazy;
//! use pg_fixtures::{db_test, SchemaRegistry, TestEnvironment};
//!
//! static FIXTURES: Lazy<TestEnvironment> = Lazy::new(|| {
//!     TestEnvironment::from_env_or_abort(
//!         SchemaRegistry::new().sql("schema", "CREATE TABLE table1 (id INT PRIMARY KEY, descr TEXT)"),
//!     )
//! });
//!
//! #[tokio::test]
//! async fn test_insert_is_rolled_back() {
//!     FIXTURES
//!         .with_session(|session| Box::pin(async move {
//!             sqlx::query("INSERT INTO table1 VALUES (1, 'a')")
//!                 .execute(&mut **session)
//!                 .await?;
//!             session.commit().await?;
//!             Ok(())
//!         }))
//!         .await
//!         .unwrap();
//! }
//!
//! db_test!(test_private_database, FIXTURES, |db| {
//!     sqlx::query("INSERT INTO table1 VALUES (1, 'a')")
//!         .execute(db.pool())
//!         .await?;
//!     Ok(())
//! });
//! ```

pub mod config;
pub mod container;
pub mod database;
pub mod environment;
pub mod error;
pub mod logging;
mod scope;
pub mod session;

pub use config::{FixtureConfig, FixtureConfigBuilder};
pub use database::TestDatabase;
pub use environment::TestEnvironment;
pub use error::FixtureError;
pub use logging::{abort_run, init_tracing};
pub use session::DbSession;

pub use pg_provision::{
    ConnectionDescriptor, DatabaseLifecycle, FnInitializer, Initializer, PoolConfig,
    ProvisioningError, SchemaRegistry, SqlScript,
};

/// Declares a test that runs against its own function-scoped database
///
/// The body sees `$db: &mut TestDatabase` and evaluates to
/// `anyhow::Result<()>`. The database is dropped whether the body succeeds,
/// fails or panics.
#[macro_export]
macro_rules! db_test {
    ($(#[$meta:meta])* $name:ident, $env:expr, |$db:ident| $body:expr) => {
        $(#[$meta])*
        #[tokio::test]
        async fn $name() {
            $env
                .with_function_database(|$db| ::std::boxed::Box::pin(async move { $body }))
                .await
                .expect("Database test failed");
        }
    };
}
