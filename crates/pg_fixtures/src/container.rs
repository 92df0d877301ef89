//! Throwaway PostgreSQL server for local runs
//!
//! When no server address is configured and container bootstrap is enabled,
//! the fixtures start PostgreSQL through `testcontainers` and point the
//! session-scoped database at it.

use pg_provision::ConnectionDescriptor;
use sqlx::{Connection, PgConnection};
use std::time::Duration;
use tokio::runtime::Runtime;
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    ContainerAsync, GenericImage, ImageExt,
};
use tracing::{debug, info};

use crate::error::FixtureError;

const POSTGRES_IMAGE: &str = "postgres";
const POSTGRES_TAG: &str = "16-alpine";
const POSTGRES_USER: &str = "postgres";
const POSTGRES_PASSWORD: &str = "masterkey";
const POSTGRES_PORT: u16 = 5432;

/// Name of the session-scoped test database inside the container
pub const CONTAINER_TEST_DATABASE: &str = "testdb";

const READY_ATTEMPTS: u32 = 30;
const READY_DELAY: Duration = Duration::from_millis(200);

/// A running PostgreSQL container
///
/// The container is started and removed on a runtime it owns. Test runtimes
/// come and go with each `#[tokio::test]`, and removal may happen from a
/// process-exit hook on yet another runtime, while the Docker client keeps
/// connections bound to the runtime that opened them.
pub struct PostgresContainer {
    container: Option<ContainerAsync<GenericImage>>,
    descriptor: ConnectionDescriptor,
    runtime: Option<Runtime>,
}

impl PostgresContainer {
    /// Starts the container and waits until it accepts connections
    ///
    /// # Errors
    ///
    /// Returns `FixtureError::ContainerBootstrap` if Docker is unavailable,
    /// the image cannot be started, or the server never becomes reachable
    pub async fn start() -> Result<Self, FixtureError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("pg-fixtures-container")
            .enable_all()
            .build()
            .map_err(|e| FixtureError::ContainerBootstrap(e.to_string()))?;

        let started = runtime.spawn(start_container()).await;
        match started {
            Ok(Ok((container, descriptor))) => Ok(Self {
                container: Some(container),
                descriptor,
                runtime: Some(runtime),
            }),
            Ok(Err(error)) => {
                runtime.shutdown_background();
                Err(error)
            }
            Err(join_error) => {
                runtime.shutdown_background();
                Err(FixtureError::ContainerBootstrap(join_error.to_string()))
            }
        }
    }

    /// Address of the session-scoped test database on this server
    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    /// Stops and removes the container
    ///
    /// Can be called from any runtime.
    pub async fn remove(mut self) -> Result<(), FixtureError> {
        let (Some(container), Some(runtime)) = (self.container.take(), self.runtime.take()) else {
            return Ok(());
        };

        let id = container.id().to_string();
        let removed = runtime.spawn(async move { container.rm().await }).await;
        runtime.shutdown_background();

        match removed {
            Ok(Ok(())) => {
                debug!(%id, "PostgreSQL container removed");
                Ok(())
            }
            Ok(Err(error)) => Err(bootstrap_error(error)),
            Err(join_error) => Err(FixtureError::ContainerBootstrap(join_error.to_string())),
        }
    }
}

impl Drop for PostgresContainer {
    fn drop(&mut self) {
        // A runtime must not be dropped from async code
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

async fn start_container() -> Result<(ContainerAsync<GenericImage>, ConnectionDescriptor), FixtureError>
{
    info!(image = POSTGRES_IMAGE, tag = POSTGRES_TAG, "Starting PostgreSQL container");

    let container = GenericImage::new(POSTGRES_IMAGE, POSTGRES_TAG)
        .with_exposed_port(POSTGRES_PORT.tcp())
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_USER", POSTGRES_USER)
        .with_env_var("POSTGRES_PASSWORD", POSTGRES_PASSWORD)
        .start()
        .await
        .map_err(bootstrap_error)?;

    let port = container
        .get_host_port_ipv4(POSTGRES_PORT)
        .await
        .map_err(bootstrap_error)?;
    let host = container.get_host().await.map_err(bootstrap_error)?.to_string();

    let descriptor = ConnectionDescriptor::from_parts(
        &host,
        port,
        POSTGRES_USER,
        Some(POSTGRES_PASSWORD),
        CONTAINER_TEST_DATABASE,
    )?;

    wait_until_ready(&descriptor).await?;
    info!(%descriptor, "PostgreSQL container ready");

    Ok((container, descriptor))
}

/// The image logs readiness once during init and again after restarting,
/// so a connection is attempted before the server is handed out
async fn wait_until_ready(descriptor: &ConnectionDescriptor) -> Result<(), FixtureError> {
    let admin = descriptor.with_database(POSTGRES_USER)?;
    let mut last_error = None;

    for attempt in 1..=READY_ATTEMPTS {
        match PgConnection::connect_with(&admin.connect_options()).await {
            Ok(conn) => {
                let _ = conn.close().await;
                return Ok(());
            }
            Err(error) => {
                debug!(attempt, %error, "PostgreSQL container not ready yet");
                last_error = Some(error);
                tokio::time::sleep(READY_DELAY).await;
            }
        }
    }

    Err(FixtureError::ContainerBootstrap(format!(
        "server never accepted connections: {}",
        last_error.map(|e| e.to_string()).unwrap_or_default()
    )))
}

fn bootstrap_error(error: testcontainers::TestcontainersError) -> FixtureError {
    FixtureError::ContainerBootstrap(error.to_string())
}
