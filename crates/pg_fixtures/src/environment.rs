//! The fixture surface used by test suites
//!
//! A [`TestEnvironment`] is usually stored in a `static` of the test binary.
//! It resolves configuration once, provisions the session-scoped database on
//! first use, and hands out function-scoped databases, sessions and raw
//! transactions.
//!
//! ```rust,ignore
//! use once_cell::sync::Lazy;
//! use pg_fixtures::{SchemaRegistry, TestEnvironment};
//!
//! static FIXTURES: Lazy<TestEnvironment> = Lazy::new(|| {
//!     TestEnvironment::from_env_or_abort(
//!         SchemaRegistry::new().sql("schema", include_str!("schema.sql")),
//!     )
//! });
//!
//! // Fail fast before any test runs, and drop the shared database at exit
//! #[ctor::ctor]
//! fn setup() {
//!     Lazy::force(&FIXTURES);
//! }
//!
//! #[ctor::dtor]
//! fn teardown() {
//!     FIXTURES.teardown_blocking();
//! }
//! ```
//!
//! Pools are bound to the runtime that opened them, and every
//! `#[tokio::test]` has its own runtime, so only the provisioned database
//! (its descriptor) is shared between tests. Each fixture call opens a pool
//! in the calling runtime.

use futures::future::LocalBoxFuture;
use pg_provision::{ConnectionDescriptor, DatabaseLifecycle, SchemaRegistry};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::OnceCell;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{DatabaseSource, FixtureConfig};
use crate::container::PostgresContainer;
use crate::database::TestDatabase;
use crate::error::FixtureError;
use crate::logging::{abort_run, init_tracing};
use crate::scope::{finish, guarded, Teardown};
use crate::session::DbSession;

/// Server the fixtures provision databases on
struct Server {
    /// Address of the session-scoped test database
    descriptor: ConnectionDescriptor,
    container: Mutex<Option<PostgresContainer>>,
}

/// Session-scoped fixture state shared by every test in a binary
pub struct TestEnvironment {
    config: FixtureConfig,
    lifecycle: DatabaseLifecycle,
    server: OnceCell<Server>,
    shared: OnceCell<ConnectionDescriptor>,
    torn_down: AtomicBool,
}

impl TestEnvironment {
    /// Creates an environment from a resolved configuration
    pub fn new(config: FixtureConfig, registry: SchemaRegistry) -> Self {
        let lifecycle = DatabaseLifecycle::new(registry)
            .admin_database(config.admin_database.clone())
            .encoding(config.encoding.clone())
            .template(config.template.clone());

        Self {
            config,
            lifecycle,
            server: OnceCell::new(),
            shared: OnceCell::new(),
            torn_down: AtomicBool::new(false),
        }
    }

    /// Resolves the configuration from the environment and installs tracing
    pub fn from_env(registry: SchemaRegistry) -> Result<Self, FixtureError> {
        let config = FixtureConfig::from_env()?;
        init_tracing(&config.log_level);

        match &config.database {
            DatabaseSource::Url { descriptor, source } => {
                info!(%descriptor, %source, "Using configured PostgreSQL server")
            }
            DatabaseSource::Container => info!("No server configured, using a PostgreSQL container"),
        }
        Ok(Self::new(config, registry))
    }

    /// Like [`from_env`](Self::from_env), but exits the process on failure
    pub fn from_env_or_abort(registry: SchemaRegistry) -> Self {
        Self::from_env(registry).unwrap_or_else(|error| abort_run(&error))
    }

    pub fn config(&self) -> &FixtureConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> &DatabaseLifecycle {
        &self.lifecycle
    }

    async fn server(&self) -> Result<&Server, FixtureError> {
        self.server
            .get_or_try_init(|| async {
                match &self.config.database {
                    DatabaseSource::Url { descriptor, .. } => Ok::<_, FixtureError>(Server {
                        descriptor: descriptor.clone(),
                        container: Mutex::new(None),
                    }),
                    DatabaseSource::Container => {
                        let container = PostgresContainer::start().await?;
                        Ok(Server {
                            descriptor: container.descriptor().clone(),
                            container: Mutex::new(Some(container)),
                        })
                    }
                }
            })
            .await
    }

    /// Address of the session-scoped database, without provisioning it
    pub async fn base_descriptor(&self) -> Result<ConnectionDescriptor, FixtureError> {
        Ok(self.server().await?.descriptor.clone())
    }

    /// The session-scoped database, provisioned on first call
    ///
    /// Later calls reuse the same database; each call opens a new pool in
    /// the calling runtime.
    pub async fn database(&self) -> Result<TestDatabase, FixtureError> {
        let descriptor = self
            .shared
            .get_or_try_init(|| async {
                let descriptor = self.base_descriptor().await?;
                self.lifecycle.provision(&descriptor).await?;
                Ok::<_, FixtureError>(descriptor)
            })
            .await?;

        TestDatabase::connect(descriptor.clone(), &self.config.pool).await
    }

    /// Runs `body` with a rollback-isolated session on the session-scoped database
    pub async fn with_session<T, F>(&self, body: F) -> Result<T, FixtureError>
    where
        F: for<'s> FnOnce(&'s mut DbSession<'_>) -> LocalBoxFuture<'s, anyhow::Result<T>>,
    {
        let database = self.database().await?;
        let result = database.with_session(body).await;
        database.close().await;
        result
    }

    /// Runs `body` with a raw transaction on the session-scoped database,
    /// rolled back afterwards
    pub async fn with_transaction<T, F>(&self, body: F) -> Result<T, FixtureError>
    where
        F: for<'t> FnOnce(
            &'t mut sqlx::Transaction<'_, sqlx::Postgres>,
        ) -> LocalBoxFuture<'t, anyhow::Result<T>>,
    {
        let database = self.database().await?;
        let result = database.with_transaction(body).await;
        database.close().await;
        result
    }

    /// Runs `body` against a database created for this call only
    ///
    /// The database is named `<base>_<suffix>_<random>` so concurrent tests
    /// never share one, gets the full schema, and is dropped on every exit
    /// path, including a panicking body.
    pub async fn with_function_database<T, F>(&self, body: F) -> Result<T, FixtureError>
    where
        F: for<'d> FnOnce(&'d mut TestDatabase) -> LocalBoxFuture<'d, anyhow::Result<T>>,
    {
        let base = self.base_descriptor().await?;
        let suffix = format!(
            "{}_{}",
            self.config.function_scope_suffix,
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let descriptor = base.scoped(&suffix)?;

        self.lifecycle.provision(&descriptor).await?;

        let mut database = match TestDatabase::connect(descriptor.clone(), &self.config.pool).await
        {
            Ok(database) => database,
            Err(error) => {
                if let Err(drop_error) = self.lifecycle.drop_database(&descriptor).await {
                    warn!(%descriptor, error = %drop_error, "Failed to drop function-scoped database");
                }
                return Err(error);
            }
        };

        let outcome = guarded(body(&mut database)).await;

        let mut teardown = Teardown::default();
        database.close().await;
        teardown.record(
            "drop database",
            self.lifecycle
                .drop_database(&descriptor)
                .await
                .map_err(FixtureError::from),
        );

        finish(outcome, teardown)
    }

    /// Drops the session-scoped database and removes the container, once
    pub async fn teardown(&self) -> Result<(), FixtureError> {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut teardown = Teardown::default();
        if let Some(descriptor) = self.shared.get() {
            teardown.record(
                "drop database",
                self.lifecycle
                    .drop_database(descriptor)
                    .await
                    .map_err(FixtureError::from),
            );
        }

        let container = self
            .server
            .get()
            .and_then(|server| server.container.lock().ok()?.take());
        if let Some(container) = container {
            teardown.record("remove container", container.remove().await);
        }

        finish(Ok(Ok(())), teardown)
    }

    /// Runs [`teardown`](Self::teardown) on a private runtime
    ///
    /// Meant for process-exit hooks, where no runtime is running. Failures
    /// are logged, not returned.
    pub fn teardown_blocking(&self) {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(error) => {
                warn!(%error, "Could not build runtime for teardown");
                return;
            }
        };

        if let Err(error) = runtime.block_on(self.teardown()) {
            warn!(%error, "Session teardown failed");
        }
    }
}
