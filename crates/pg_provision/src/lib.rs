//! Throwaway PostgreSQL databases
//!
//! This crate manages the server-side lifecycle of databases used by test
//! suites: create a uniquely named database, stamp a schema onto it, and drop
//! it again even if other sessions are still connected.
//!
//! # Modules
//!
//! - `descriptor`: connection addresses with a substitutable database name
//! - `schema`: the registry of initializers applied to every new database
//! - `lifecycle`: create / initialize / drop through an administrative connection
//! - `pool`: connection pools handed to tests
//! - `error`: `ProvisioningError`
//!
//! # Example
//!
//! ```rust,ignore
//! use pg_provision::{ConnectionDescriptor, DatabaseLifecycle, SchemaRegistry};
//!
//! let lifecycle = DatabaseLifecycle::new(
//!     SchemaRegistry::new().sql("schema", include_str!("../schema.sql")),
//! );
//! let descriptor = ConnectionDescriptor::from_url("postgres://postgres:pw@localhost/testdb")?;
//!
//! lifecycle.provision(&descriptor).await?;
//! lifecycle.drop_database(&descriptor).await?;
//! ```

pub mod descriptor;
pub mod error;
pub mod lifecycle;
pub mod pool;
pub mod schema;

pub use descriptor::ConnectionDescriptor;
pub use error::ProvisioningError;
pub use lifecycle::DatabaseLifecycle;
pub use pool::{connect_pool, PoolConfig};
pub use schema::{BoxError, FnInitializer, Initializer, SchemaRegistry, SqlScript};
