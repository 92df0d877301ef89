//! Fixture error types

use pg_provision::ProvisioningError;
use thiserror::Error;

/// Exit status used when the suite cannot resolve or parse its configuration
pub const EXIT_CONFIGURATION: i32 = 4;
/// Exit status used when the PostgreSQL container cannot be started
pub const EXIT_CONTAINER_BOOTSTRAP: i32 = 9;
/// Exit status for any other fatal fixture failure
pub const EXIT_FAILURE: i32 = 1;

/// Errors raised while setting up, running or tearing down a fixture
#[derive(Debug, Error)]
pub enum FixtureError {
    /// No provider in the resolution chain supplied a required setting
    #[error("Setting '{key}' is not configured ({hint}); tried: {}", .tried.join(", "))]
    NotConfigured {
        key: String,
        hint: String,
        tried: Vec<String>,
    },

    /// A setting was supplied but could not be used
    #[error("Invalid configuration for '{key}': {message}")]
    InvalidConfiguration { key: String, message: String },

    /// The PostgreSQL container could not be started
    #[error("Failed to start PostgreSQL container: {0}")]
    ContainerBootstrap(String),

    /// Creating, initializing or dropping a database failed
    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),

    /// A connection or transaction for the test could not be opened
    #[error("Failed to open test connection: {0}")]
    Connection(#[source] sqlx::Error),

    /// One of the teardown steps failed after the test body finished
    #[error("Teardown step '{step}' failed: {source}")]
    Teardown {
        step: &'static str,
        #[source]
        source: sqlx::Error,
    },

    /// The test body returned an error
    #[error("Test body failed: {0:#}")]
    Body(anyhow::Error),
}

impl FixtureError {
    pub fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        FixtureError::InvalidConfiguration {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Process exit status used by [`abort_run`](crate::abort_run)
    pub fn exit_code(&self) -> i32 {
        match self {
            FixtureError::NotConfigured { .. } | FixtureError::InvalidConfiguration { .. } => {
                EXIT_CONFIGURATION
            }
            FixtureError::ContainerBootstrap(_) => EXIT_CONTAINER_BOOTSTRAP,
            _ => EXIT_FAILURE,
        }
    }

    /// Checks if this error should stop the whole run rather than one test
    pub fn is_fatal(&self) -> bool {
        self.exit_code() != EXIT_FAILURE
    }
}

impl From<config::ConfigError> for FixtureError {
    fn from(error: config::ConfigError) -> Self {
        FixtureError::invalid("environment", error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_configured_names_key_and_providers() {
        let error = FixtureError::NotConfigured {
            key: "database_url".to_string(),
            hint: "set PG_FIXTURES_DATABASE_URL".to_string(),
            tried: vec!["environment".to_string(), "overrides".to_string()],
        };
        let display = error.to_string();

        assert!(display.contains("database_url"));
        assert!(display.contains("PG_FIXTURES_DATABASE_URL"));
        assert!(display.contains("environment, overrides"));
        assert_eq!(error.exit_code(), EXIT_CONFIGURATION);
        assert!(error.is_fatal());
    }

    #[test]
    fn test_exit_codes_are_distinct() {
        let container = FixtureError::ContainerBootstrap("docker not found".to_string());
        let body = FixtureError::Body(anyhow::anyhow!("assertion failed"));

        assert_eq!(container.exit_code(), EXIT_CONTAINER_BOOTSTRAP);
        assert_eq!(body.exit_code(), EXIT_FAILURE);
        assert!(!body.is_fatal());
        assert_ne!(EXIT_CONFIGURATION, EXIT_CONTAINER_BOOTSTRAP);
    }

    #[test]
    fn test_provisioning_error_converts() {
        let error: FixtureError = ProvisioningError::invalid_name("", "must not be empty").into();
        assert!(matches!(error, FixtureError::Provisioning(_)));
        assert!(error.to_string().contains("must not be empty"));
    }
}
