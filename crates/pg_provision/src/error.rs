//! Provisioning error types
//!
//! Every failure while creating, initializing or dropping a database is
//! reported through [`ProvisioningError`]. Teardown failures are surfaced
//! like any other, since a database that failed to drop is leaked on the
//! shared server.

use thiserror::Error;

/// Errors that can occur while managing the lifecycle of a test database
#[derive(Debug, Error)]
pub enum ProvisioningError {
    /// The database name cannot be used as a PostgreSQL identifier
    #[error("Invalid database name '{name}': {reason}")]
    InvalidDatabaseName { name: String, reason: String },

    /// The connection URL could not be parsed
    #[error("Invalid connection URL: {0}")]
    InvalidUrl(#[source] sqlx::Error),

    /// Could not open the administrative connection
    #[error("Failed to connect to administrative database '{database}': {source}")]
    AdminConnection {
        database: String,
        #[source]
        source: sqlx::Error,
    },

    /// Could not connect to the database being initialized
    #[error("Failed to connect to database '{database}': {source}")]
    ConnectFailed {
        database: String,
        #[source]
        source: sqlx::Error,
    },

    /// The `pg_database` catalog lookup failed
    #[error("Catalog lookup for database '{database}' failed: {source}")]
    CatalogQuery {
        database: String,
        #[source]
        source: sqlx::Error,
    },

    /// The server rejected `CREATE DATABASE`
    #[error("Failed to create database '{database}': {source}")]
    CreateFailed {
        database: String,
        #[source]
        source: sqlx::Error,
    },

    /// Other backends bound to the database could not be terminated
    #[error("Failed to terminate connections to database '{database}': {source}")]
    TerminateFailed {
        database: String,
        #[source]
        source: sqlx::Error,
    },

    /// The server rejected `DROP DATABASE`
    #[error("Failed to drop database '{database}': {source}")]
    DropFailed {
        database: String,
        #[source]
        source: sqlx::Error,
    },

    /// A registered initializer failed to stamp its schema
    #[error("Initializer '{initializer}' failed on database '{database}': {source}")]
    InitializationFailed {
        database: String,
        initializer: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The connection pool for a provisioned database could not be opened
    #[error("Failed to open connection pool for database '{database}': {source}")]
    PoolFailed {
        database: String,
        #[source]
        source: sqlx::Error,
    },
}

impl ProvisioningError {
    /// Creates an invalid database name error
    pub fn invalid_name(name: impl Into<String>, reason: impl Into<String>) -> Self {
        ProvisioningError::InvalidDatabaseName {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Name of the database the failure relates to, if any
    pub fn database(&self) -> Option<&str> {
        match self {
            ProvisioningError::InvalidDatabaseName { name, .. } => Some(name),
            ProvisioningError::InvalidUrl(_) => None,
            ProvisioningError::AdminConnection { database, .. }
            | ProvisioningError::ConnectFailed { database, .. }
            | ProvisioningError::CatalogQuery { database, .. }
            | ProvisioningError::CreateFailed { database, .. }
            | ProvisioningError::TerminateFailed { database, .. }
            | ProvisioningError::DropFailed { database, .. }
            | ProvisioningError::InitializationFailed { database, .. }
            | ProvisioningError::PoolFailed { database, .. } => Some(database),
        }
    }

    /// Checks if this error happened while removing a database
    pub fn is_teardown_error(&self) -> bool {
        matches!(
            self,
            ProvisioningError::TerminateFailed { .. } | ProvisioningError::DropFailed { .. }
        )
    }

    /// PostgreSQL SQLSTATE code of the underlying server error, if any
    ///
    /// See <https://www.postgresql.org/docs/current/errcodes-appendix.html>
    pub fn sqlstate(&self) -> Option<String> {
        let source = match self {
            ProvisioningError::InvalidUrl(e)
            | ProvisioningError::AdminConnection { source: e, .. }
            | ProvisioningError::ConnectFailed { source: e, .. }
            | ProvisioningError::CatalogQuery { source: e, .. }
            | ProvisioningError::CreateFailed { source: e, .. }
            | ProvisioningError::TerminateFailed { source: e, .. }
            | ProvisioningError::DropFailed { source: e, .. }
            | ProvisioningError::PoolFailed { source: e, .. } => e,
            _ => return None,
        };

        match source {
            sqlx::Error::Database(db_err) => db_err.code().map(|code| code.into_owned()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_name_display() {
        let error = ProvisioningError::invalid_name("", "must not be empty");
        let display = error.to_string();

        assert!(display.contains("Invalid database name"));
        assert!(display.contains("must not be empty"));
        assert_eq!(error.database(), Some(""));
    }

    #[test]
    fn test_teardown_classification() {
        let drop = ProvisioningError::DropFailed {
            database: "testdb".to_string(),
            source: sqlx::Error::PoolClosed,
        };
        let create = ProvisioningError::CreateFailed {
            database: "testdb".to_string(),
            source: sqlx::Error::PoolClosed,
        };

        assert!(drop.is_teardown_error());
        assert!(!create.is_teardown_error());
        assert_eq!(create.database(), Some("testdb"));
        assert_eq!(create.sqlstate(), None);
    }
}
