//! Database lifecycle management
//!
//! [`DatabaseLifecycle`] creates, initializes and drops whole databases.
//! Server-level statements go through an administrative connection to a
//! baseline database on the same server and run outside any transaction
//! block, since PostgreSQL rejects `CREATE DATABASE` and `DROP DATABASE`
//! inside one.

use sqlx::{Connection, PgConnection};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::descriptor::{quote_identifier, quote_literal, ConnectionDescriptor};
use crate::error::ProvisioningError;
use crate::schema::SchemaRegistry;

/// Baseline database every PostgreSQL cluster ships with
pub const DEFAULT_ADMIN_DATABASE: &str = "postgres";
pub const DEFAULT_ENCODING: &str = "utf8";
pub const DEFAULT_TEMPLATE: &str = "template1";

/// SQLSTATE `object_in_use`, raised while terminated backends are still exiting
const OBJECT_IN_USE: &str = "55006";
const DROP_ATTEMPTS: u32 = 5;
const DROP_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Creates, initializes and drops test databases
///
/// # Example
///
/// ```rust,ignore
/// use pg_provision::{ConnectionDescriptor, DatabaseLifecycle, SchemaRegistry};
///
/// let registry = SchemaRegistry::new()
///     .sql("table1", "CREATE TABLE table1 (id INTEGER PRIMARY KEY, descr TEXT)");
/// let lifecycle = DatabaseLifecycle::new(registry);
///
/// let descriptor = ConnectionDescriptor::from_url("postgres://postgres:pw@localhost/testdb")?;
/// lifecycle.provision(&descriptor).await?;
/// // ... run tests against `testdb` ...
/// lifecycle.drop_database(&descriptor).await?;
/// ```
#[derive(Debug, Clone)]
pub struct DatabaseLifecycle {
    registry: SchemaRegistry,
    admin_database: String,
    encoding: String,
    template: String,
}

impl DatabaseLifecycle {
    /// Creates a lifecycle manager that stamps `registry` onto every new database
    pub fn new(registry: SchemaRegistry) -> Self {
        Self {
            registry,
            admin_database: DEFAULT_ADMIN_DATABASE.to_string(),
            encoding: DEFAULT_ENCODING.to_string(),
            template: DEFAULT_TEMPLATE.to_string(),
        }
    }

    /// Sets the database used for administrative connections (default: `postgres`)
    pub fn admin_database(mut self, database: impl Into<String>) -> Self {
        self.admin_database = database.into();
        self
    }

    /// Sets the encoding of created databases (default: `utf8`)
    pub fn encoding(mut self, encoding: impl Into<String>) -> Self {
        self.encoding = encoding.into();
        self
    }

    /// Sets the template created databases are copied from (default: `template1`)
    pub fn template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Statement issued by [`create_database`](Self::create_database)
    pub fn create_statement(&self, database: &str) -> String {
        format!(
            "CREATE DATABASE {} ENCODING {} TEMPLATE {}",
            quote_identifier(database),
            quote_literal(&self.encoding),
            quote_identifier(&self.template)
        )
    }

    /// Creates an empty database, replacing any existing one with the same name
    ///
    /// # Errors
    ///
    /// Returns a `ProvisioningError` if the administrative connection, the
    /// catalog lookup, the replacement drop or the `CREATE DATABASE` fails
    pub async fn create_database(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<(), ProvisioningError> {
        let database = descriptor.database();
        let mut conn = self.admin_connection(descriptor).await?;

        let result = async {
            if self.exists_on(&mut conn, database).await? {
                info!(database, "Database already exists, replacing it");
                self.drop_on(&mut conn, database).await?;
            }

            let statement = self.create_statement(database);
            debug!(%statement, "Creating database");
            sqlx::raw_sql(&statement)
                .execute(&mut conn)
                .await
                .map_err(|source| ProvisioningError::CreateFailed {
                    database: database.to_string(),
                    source,
                })?;
            Ok::<(), ProvisioningError>(())
        }
        .await;

        close_quietly(conn).await;
        result?;

        info!(%descriptor, "Database created");
        Ok(())
    }

    /// Drops a database after terminating every other connection to it
    ///
    /// # Errors
    ///
    /// Returns a `ProvisioningError` if termination or the drop fails,
    /// including when the database does not exist
    pub async fn drop_database(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<(), ProvisioningError> {
        let mut conn = self.admin_connection(descriptor).await?;
        let result = self.drop_on(&mut conn, descriptor.database()).await;
        close_quietly(conn).await;
        result?;

        info!(%descriptor, "Database dropped");
        Ok(())
    }

    /// Checks the `pg_database` catalog for the descriptor's database
    pub async fn database_exists(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<bool, ProvisioningError> {
        let mut conn = self.admin_connection(descriptor).await?;
        let result = self.exists_on(&mut conn, descriptor.database()).await;
        close_quietly(conn).await;
        result
    }

    /// Applies the schema registry to an existing database in one transaction
    pub async fn initialize(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<(), ProvisioningError> {
        let database = descriptor.database();
        let mut conn = PgConnection::connect_with(&descriptor.connect_options())
            .await
            .map_err(|source| ProvisioningError::ConnectFailed {
                database: database.to_string(),
                source,
            })?;

        let result = async {
            let mut tx = conn
                .begin()
                .await
                .map_err(|e| transaction_error(database, e))?;
            self.registry.apply(database, &mut tx).await?;
            tx.commit().await.map_err(|e| transaction_error(database, e))
        }
        .await;

        close_quietly(conn).await;
        result?;

        info!(
            database,
            initializers = self.registry.len(),
            "Database initialized"
        );
        Ok(())
    }

    /// Creates the database and applies the schema registry to it
    ///
    /// If initialization fails the half-built database is dropped again
    /// before the initialization error is returned.
    pub async fn provision(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<(), ProvisioningError> {
        self.create_database(descriptor).await?;

        if let Err(error) = self.initialize(descriptor).await {
            if let Err(drop_error) = self.drop_database(descriptor).await {
                warn!(%descriptor, error = %drop_error, "Failed to drop partially initialized database");
            }
            return Err(error);
        }
        Ok(())
    }

    async fn admin_connection(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<PgConnection, ProvisioningError> {
        if descriptor.database() == self.admin_database {
            return Err(ProvisioningError::invalid_name(
                descriptor.database(),
                "is the administrative database",
            ));
        }

        let admin = descriptor.with_database(&self.admin_database)?;
        debug!(%admin, "Opening administrative connection");
        PgConnection::connect_with(&admin.connect_options())
            .await
            .map_err(|source| ProvisioningError::AdminConnection {
                database: self.admin_database.clone(),
                source,
            })
    }

    async fn exists_on(
        &self,
        conn: &mut PgConnection,
        database: &str,
    ) -> Result<bool, ProvisioningError> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM pg_database WHERE datname = $1)",
        )
        .bind(database)
        .fetch_one(&mut *conn)
        .await
        .map_err(|source| ProvisioningError::CatalogQuery {
            database: database.to_string(),
            source,
        })
    }

    async fn drop_on(
        &self,
        conn: &mut PgConnection,
        database: &str,
    ) -> Result<(), ProvisioningError> {
        let terminated = sqlx::query_scalar::<_, bool>(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
             WHERE datname = $1 AND pid <> pg_backend_pid()",
        )
        .bind(database)
        .fetch_all(&mut *conn)
        .await
        .map_err(|source| ProvisioningError::TerminateFailed {
            database: database.to_string(),
            source,
        })?
        .into_iter()
        .filter(|killed| *killed)
        .count();

        if terminated > 0 {
            debug!(database, terminated, "Terminated backends");
        }

        let statement = format!("DROP DATABASE {}", quote_identifier(database));
        let mut attempt = 1;
        loop {
            match sqlx::raw_sql(&statement).execute(&mut *conn).await {
                Ok(_) => return Ok(()),
                // Terminated backends exit asynchronously
                Err(sqlx::Error::Database(db_err))
                    if db_err.code().as_deref() == Some(OBJECT_IN_USE)
                        && attempt < DROP_ATTEMPTS =>
                {
                    debug!(database, attempt, "Database still in use, retrying drop");
                    attempt += 1;
                    tokio::time::sleep(DROP_RETRY_DELAY).await;
                }
                Err(source) => {
                    return Err(ProvisioningError::DropFailed {
                        database: database.to_string(),
                        source,
                    })
                }
            }
        }
    }
}

fn transaction_error(database: &str, source: sqlx::Error) -> ProvisioningError {
    ProvisioningError::InitializationFailed {
        database: database.to_string(),
        initializer: "transaction".to_string(),
        source: Box::new(source),
    }
}

async fn close_quietly(conn: PgConnection) {
    if let Err(error) = conn.close().await {
        warn!(%error, "Failed to close connection cleanly");
    }
}
