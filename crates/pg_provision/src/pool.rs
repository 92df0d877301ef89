//! Connection pools for provisioned databases
//!
//! Each provisioned database is exposed to tests through a small `PgPool`.
//! The pool is the connection source sessions draw from; it is closed before
//! the database is dropped.

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

use crate::descriptor::ConnectionDescriptor;
use crate::error::ProvisioningError;

/// Pool settings for test databases
///
/// # Example
///
/// ```rust
/// use pg_provision::PoolConfig;
/// use std::time::Duration;
///
/// let config = PoolConfig::new()
///     .max_connections(8)
///     .acquire_timeout(Duration::from_secs(10));
/// assert_eq!(config.max_connections, 8);
/// ```
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Minimum number of connections to maintain
    pub min_connections: u32,
    /// How long to wait for a free connection
    pub acquire_timeout: Duration,
    /// Idle timeout before closing a connection
    pub idle_timeout: Duration,
}

impl PoolConfig {
    /// Creates a configuration sized for a test suite
    pub fn new() -> Self {
        Self {
            max_connections: 5,
            min_connections: 0,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
        }
    }

    /// Sets the maximum number of connections in the pool
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the minimum number of connections to maintain
    pub fn min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    /// Sets how long to wait for a free connection
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Sets the idle timeout before closing a connection
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Opens a connection pool to the database named by `descriptor`
///
/// # Errors
///
/// Returns `ProvisioningError::PoolFailed` if the first connection cannot be established
pub async fn connect_pool(
    descriptor: &ConnectionDescriptor,
    config: &PoolConfig,
) -> Result<PgPool, ProvisioningError> {
    info!(
        database = descriptor.database(),
        max_connections = config.max_connections,
        "Opening connection pool"
    );

    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .connect_with(descriptor.connect_options())
        .await
        .map_err(|source| ProvisioningError::PoolFailed {
            database: descriptor.database().to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = PoolConfig::new()
            .max_connections(50)
            .min_connections(10)
            .acquire_timeout(Duration::from_secs(60));

        assert_eq!(config.max_connections, 50);
        assert_eq!(config.min_connections, 10);
        assert_eq!(config.acquire_timeout, Duration::from_secs(60));
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
    }
}
