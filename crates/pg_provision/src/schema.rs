//! Schema registry
//!
//! Schema for a fresh test database is stamped by [`Initializer`]s collected
//! in a [`SchemaRegistry`]. The registry is built by the test suite and handed
//! to [`DatabaseLifecycle`](crate::DatabaseLifecycle), so nothing about the
//! schema lives in process-wide state.

use async_trait::async_trait;
use futures::future::BoxFuture;
use sqlx::migrate::Migrator;
use sqlx::PgConnection;
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::error::ProvisioningError;

/// Boxed error returned by initializers
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A procedure that stamps schema objects onto a freshly created database
///
/// Initializers run exactly once per database instance, inside the
/// transaction opened by [`SchemaRegistry::apply`]'s caller.
#[async_trait]
pub trait Initializer: Send + Sync {
    /// Short label used in logs and error messages
    fn name(&self) -> &str;

    /// Creates the schema objects using the given connection
    async fn initialize(&self, conn: &mut PgConnection) -> Result<(), BoxError>;
}

/// Initializer that executes a SQL script, possibly containing several statements
#[derive(Debug, Clone)]
pub struct SqlScript {
    name: String,
    sql: Cow<'static, str>,
}

impl SqlScript {
    pub fn new(name: impl Into<String>, sql: impl Into<Cow<'static, str>>) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
        }
    }
}

#[async_trait]
impl Initializer for SqlScript {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self, conn: &mut PgConnection) -> Result<(), BoxError> {
        sqlx::Executor::execute(conn, sqlx::raw_sql(&self.sql)).await?;
        Ok(())
    }
}

/// Initializer backed by an async closure
///
/// The returned future must be `Send`, so statements go through
/// [`sqlx::Executor`] methods on the connection:
///
/// ```rust,ignore
/// use sqlx::Executor;
///
/// let init = FnInitializer::new("seed", |conn| Box::pin(async move {
///     conn.execute("INSERT INTO flags (name) VALUES ('on')").await?;
///     Ok(())
/// }));
/// ```
pub struct FnInitializer<F> {
    name: String,
    func: F,
}

impl<F> FnInitializer<F>
where
    F: for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, Result<(), BoxError>> + Send + Sync,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

#[async_trait]
impl<F> Initializer for FnInitializer<F>
where
    F: for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, Result<(), BoxError>> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self, conn: &mut PgConnection) -> Result<(), BoxError> {
        (self.func)(conn).await
    }
}

/// Runs embedded `sqlx` migrations, e.g. from `sqlx::migrate!("./migrations")`
#[async_trait]
impl Initializer for Migrator {
    fn name(&self) -> &str {
        "migrations"
    }

    async fn initialize(&self, conn: &mut PgConnection) -> Result<(), BoxError> {
        self.run_direct(conn).await?;
        Ok(())
    }
}

/// Ordered collection of initializers applied to every provisioned database
///
/// # Example
///
/// ```rust
/// use pg_provision::{SchemaRegistry, SqlScript};
///
/// let registry = SchemaRegistry::new()
///     .with(SqlScript::new("table1", "CREATE TABLE table1 (id INTEGER PRIMARY KEY, descr TEXT)"));
///
/// assert_eq!(registry.names(), vec!["table1"]);
/// ```
#[derive(Clone, Default)]
pub struct SchemaRegistry {
    initializers: Vec<Arc<dyn Initializer>>,
}

impl SchemaRegistry {
    /// Creates an empty registry; databases provisioned with it stay empty
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an initializer, builder style
    pub fn with(mut self, initializer: impl Initializer + 'static) -> Self {
        self.register(initializer);
        self
    }

    /// Adds an initializer after the ones already registered
    pub fn register(&mut self, initializer: impl Initializer + 'static) {
        self.initializers.push(Arc::new(initializer));
    }

    /// Adds a SQL script initializer
    pub fn sql(self, name: impl Into<String>, sql: impl Into<Cow<'static, str>>) -> Self {
        self.with(SqlScript::new(name, sql))
    }

    pub fn len(&self) -> usize {
        self.initializers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.initializers.is_empty()
    }

    /// Initializer names in application order
    pub fn names(&self) -> Vec<&str> {
        self.initializers.iter().map(|i| i.name()).collect()
    }

    /// Runs every initializer in registration order, stopping at the first failure
    ///
    /// # Arguments
    ///
    /// * `database` - Name of the database being initialized, for error context
    /// * `conn` - Live connection to that database
    pub async fn apply(
        &self,
        database: &str,
        conn: &mut PgConnection,
    ) -> Result<(), ProvisioningError> {
        for initializer in &self.initializers {
            debug!(database, initializer = initializer.name(), "Applying initializer");
            initializer
                .initialize(&mut *conn)
                .await
                .map_err(|source| ProvisioningError::InitializationFailed {
                    database: database.to_string(),
                    initializer: initializer.name().to_string(),
                    source,
                })?;
        }
        Ok(())
    }
}

impl fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("initializers", &self.names())
            .finish()
    }
}
