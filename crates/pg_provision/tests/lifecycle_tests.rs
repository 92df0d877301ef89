//! Lifecycle tests against a live PostgreSQL server
//!
//! These tests need a server that accepts `CREATE DATABASE`:
//!
//!   PG_FIXTURES_DATABASE_URL=postgres://postgres:pw@localhost/provision_test \
//!     cargo test -p pg_provision -- --ignored

use pg_provision::{
    ConnectionDescriptor, DatabaseLifecycle, FnInitializer, ProvisioningError, SchemaRegistry,
};
use sqlx::{Connection, Executor, PgConnection};

fn descriptor(suffix: &str) -> ConnectionDescriptor {
    let url = std::env::var("PG_FIXTURES_DATABASE_URL")
        .expect("PG_FIXTURES_DATABASE_URL must be set for database tests");
    ConnectionDescriptor::from_url(&url)
        .and_then(|d| d.scoped(suffix))
        .expect("invalid PG_FIXTURES_DATABASE_URL")
}

fn lifecycle() -> DatabaseLifecycle {
    DatabaseLifecycle::new(
        SchemaRegistry::new().sql(
            "table1",
            "CREATE TABLE table1 (id INTEGER PRIMARY KEY, descr VARCHAR)",
        ),
    )
}

async fn count_rows(descriptor: &ConnectionDescriptor) -> i64 {
    let mut conn = PgConnection::connect_with(&descriptor.connect_options())
        .await
        .expect("connect");
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM table1")
        .fetch_one(&mut conn)
        .await
        .expect("count");
    conn.close().await.expect("close");
    count
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_provision_creates_schema() {
    let lifecycle = lifecycle();
    let descriptor = descriptor("lc_schema");

    lifecycle.provision(&descriptor).await.expect("provision");
    assert!(lifecycle.database_exists(&descriptor).await.unwrap());
    assert_eq!(count_rows(&descriptor).await, 0);

    lifecycle.drop_database(&descriptor).await.expect("drop");
    assert!(!lifecycle.database_exists(&descriptor).await.unwrap());
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_create_twice_replaces_database() {
    let lifecycle = lifecycle();
    let descriptor = descriptor("lc_replace");

    lifecycle.provision(&descriptor).await.expect("first provision");
    let mut conn = PgConnection::connect_with(&descriptor.connect_options())
        .await
        .unwrap();
    sqlx::query("INSERT INTO table1 (id, descr) VALUES (1, 'a')")
        .execute(&mut conn)
        .await
        .unwrap();
    conn.close().await.unwrap();

    // Second create must replace, never fail with "already exists"
    lifecycle.create_database(&descriptor).await.expect("second create");
    let mut conn = PgConnection::connect_with(&descriptor.connect_options())
        .await
        .unwrap();
    let tables: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM information_schema.tables WHERE table_name = 'table1'",
    )
    .fetch_one(&mut conn)
    .await
    .unwrap();
    conn.close().await.unwrap();
    assert_eq!(tables, 0, "recreated database must be empty");

    lifecycle.drop_database(&descriptor).await.expect("drop");
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_drop_terminates_live_connections() {
    let lifecycle = lifecycle();
    let descriptor = descriptor("lc_in_use");
    lifecycle.provision(&descriptor).await.expect("provision");

    let mut held = PgConnection::connect_with(&descriptor.connect_options())
        .await
        .unwrap();
    sqlx::query("SELECT 1").execute(&mut held).await.unwrap();

    lifecycle.drop_database(&descriptor).await.expect("drop with live connection");
    assert!(!lifecycle.database_exists(&descriptor).await.unwrap());
    assert!(sqlx::query("SELECT 1").execute(&mut held).await.is_err());
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_drop_missing_database_is_reported() {
    let lifecycle = lifecycle();
    let descriptor = descriptor("lc_missing");

    let result = lifecycle.drop_database(&descriptor).await;
    match result {
        Err(error @ ProvisioningError::DropFailed { .. }) => {
            assert!(error.is_teardown_error());
            assert_eq!(error.sqlstate().as_deref(), Some("3D000"));
        }
        other => panic!("Expected DropFailed, got {:?}", other),
    }
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_failed_initializer_leaves_no_database() {
    let lifecycle = DatabaseLifecycle::new(
        SchemaRegistry::new().sql("broken", "CREATE TABLE broken (id NOT_A_TYPE)"),
    );
    let descriptor = descriptor("lc_broken");

    let result = lifecycle.provision(&descriptor).await;
    assert!(matches!(
        result,
        Err(ProvisioningError::InitializationFailed { ref initializer, .. }) if initializer == "broken"
    ));
    assert!(!lifecycle.database_exists(&descriptor).await.unwrap());
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_fn_initializer_seeds_rows() {
    let lifecycle = DatabaseLifecycle::new(
        SchemaRegistry::new()
            .sql(
                "table1",
                "CREATE TABLE table1 (id INTEGER PRIMARY KEY, descr VARCHAR)",
            )
            .with(FnInitializer::new("seed", |conn| {
                Box::pin(async move {
                    conn.execute("INSERT INTO table1 (id, descr) VALUES (1, 'seeded')")
                        .await?;
                    Ok(())
                })
            })),
    );
    let descriptor = descriptor("lc_seeded");

    lifecycle.provision(&descriptor).await.expect("provision");

    let mut conn = PgConnection::connect_with(&descriptor.connect_options())
        .await
        .unwrap();
    let descr: String = sqlx::query_scalar("SELECT descr FROM table1 WHERE id = 1")
        .fetch_one(&mut conn)
        .await
        .unwrap();
    conn.close().await.unwrap();
    assert_eq!(descr, "seeded");

    lifecycle.drop_database(&descriptor).await.expect("drop");
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_migrator_initializer_applies_migrations() {
    let lifecycle =
        DatabaseLifecycle::new(SchemaRegistry::new().with(sqlx::migrate!("tests/migrations")));
    let descriptor = descriptor("lc_migrated");

    lifecycle.provision(&descriptor).await.expect("provision");

    let mut conn = PgConnection::connect_with(&descriptor.connect_options())
        .await
        .unwrap();
    let exists: bool = sqlx::query_scalar("SELECT to_regclass('public.widgets') IS NOT NULL")
        .fetch_one(&mut conn)
        .await
        .unwrap();
    let label: String = sqlx::query_scalar("SELECT label FROM widgets WHERE id = 1")
        .fetch_one(&mut conn)
        .await
        .unwrap();
    let applied: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM _sqlx_migrations")
        .fetch_one(&mut conn)
        .await
        .unwrap();
    conn.close().await.unwrap();

    assert!(exists);
    assert_eq!(label, "sprocket");
    assert_eq!(applied, 2);

    lifecycle.drop_database(&descriptor).await.expect("drop");
}
