//! Fixture tests against a live PostgreSQL server
//!
//! Run with a server that accepts `CREATE DATABASE`:
//!
//!   PG_FIXTURES_DATABASE_URL=postgres://postgres:pw@localhost/testdb \
//!     cargo test -p pg_fixtures -- --ignored
//!
//! or let the fixtures start a container with `PG_FIXTURES_CONTAINER=true`.

use futures::FutureExt;
use once_cell::sync::Lazy;
use pg_fixtures::{db_test, ConnectionDescriptor, FixtureError, SchemaRegistry, TestEnvironment};
use sqlx::PgConnection;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

const INSERT_ROW: &str = "INSERT INTO table1 (id, descr) VALUES (1, 'a')";

static FIXTURES: Lazy<TestEnvironment> =
    Lazy::new(|| TestEnvironment::from_env_or_abort(schema()));

fn schema() -> SchemaRegistry {
    SchemaRegistry::new().sql(
        "table1",
        "CREATE TABLE table1 (id INTEGER PRIMARY KEY, descr VARCHAR)",
    )
}

#[ctor::dtor]
fn teardown_fixtures() {
    if let Some(fixtures) = Lazy::get(&FIXTURES) {
        fixtures.teardown_blocking();
    }
}

async fn count_rows(conn: &mut PgConnection) -> anyhow::Result<i64> {
    Ok(sqlx::query_scalar("SELECT COUNT(*) FROM table1")
        .fetch_one(conn)
        .await?)
}

async fn rows_in_fresh_session() -> i64 {
    FIXTURES
        .with_session(|session| Box::pin(async move { count_rows(&mut **session).await }))
        .await
        .expect("fresh session")
}

fn explode() -> anyhow::Result<()> {
    panic!("body panicked")
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_committed_insert_is_rolled_back() {
    let seen = FIXTURES
        .with_session(|session| {
            Box::pin(async move {
                sqlx::query(INSERT_ROW).execute(&mut **session).await?;
                session.commit().await?;
                assert_eq!(session.commits(), 1);
                count_rows(&mut **session).await
            })
        })
        .await
        .expect("session");

    assert_eq!(seen, 1);
    assert_eq!(rows_in_fresh_session().await, 0);
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_session_rollback_keeps_committed_work() {
    let seen = FIXTURES
        .with_session(|session| {
            Box::pin(async move {
                sqlx::query(INSERT_ROW).execute(&mut **session).await?;
                session.commit().await?;
                sqlx::query("INSERT INTO table1 (id, descr) VALUES (2, 'b')")
                    .execute(&mut **session)
                    .await?;
                session.rollback().await?;
                count_rows(&mut **session).await
            })
        })
        .await
        .expect("session");

    assert_eq!(seen, 1);
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_nested_transaction_commit_is_discarded() {
    let seen = FIXTURES
        .with_session(|session| {
            Box::pin(async move {
                let mut tx = session.begin().await?;
                sqlx::query(INSERT_ROW).execute(&mut *tx).await?;
                tx.commit().await?;
                count_rows(&mut **session).await
            })
        })
        .await
        .expect("session");

    assert_eq!(seen, 1);
    assert_eq!(rows_in_fresh_session().await, 0);
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_body_error_still_rolls_back() {
    let result: Result<(), FixtureError> = FIXTURES
        .with_session(|session| {
            Box::pin(async move {
                sqlx::query(INSERT_ROW).execute(&mut **session).await?;
                session.commit().await?;
                Err(anyhow::anyhow!("assertion in body failed"))
            })
        })
        .await;

    match result {
        Err(FixtureError::Body(error)) => {
            assert!(error.to_string().contains("assertion in body failed"))
        }
        other => panic!("Expected Body error, got {:?}", other),
    }
    assert_eq!(rows_in_fresh_session().await, 0);
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_panicking_body_still_rolls_back() {
    let result = AssertUnwindSafe(FIXTURES.with_session(|session| {
        Box::pin(async move {
            sqlx::query(INSERT_ROW).execute(&mut **session).await?;
            session.commit().await?;
            explode()
        })
    }))
    .catch_unwind()
    .await;

    assert!(result.is_err(), "panic should be resumed after teardown");
    assert_eq!(rows_in_fresh_session().await, 0);
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_raw_transaction_is_rolled_back() {
    let seen = FIXTURES
        .with_transaction(|tx| {
            Box::pin(async move {
                sqlx::query(INSERT_ROW).execute(&mut **tx).await?;
                count_rows(&mut **tx).await
            })
        })
        .await
        .expect("transaction");

    assert_eq!(seen, 1);
    assert_eq!(rows_in_fresh_session().await, 0);
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_function_databases_are_distinct() {
    let run = || {
        FIXTURES.with_function_database(|db| {
            Box::pin(async move {
                sqlx::query(INSERT_ROW).execute(db.pool()).await?;
                let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM table1")
                    .fetch_one(db.pool())
                    .await?;
                Ok((db.descriptor().clone(), count))
            })
        })
    };

    let (first, second) = tokio::join!(run(), run());
    let (first, first_count) = first.expect("first function database");
    let (second, second_count) = second.expect("second function database");

    assert_ne!(first.database(), second.database());
    assert!(first.database().contains("_function_scoped_"));
    assert_eq!((first_count, second_count), (1, 1));

    for descriptor in [&first, &second] {
        let exists = FIXTURES.lifecycle().database_exists(descriptor).await.unwrap();
        assert!(!exists, "{} should have been dropped", descriptor.database());
    }
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_function_database_dropped_after_panic() {
    let seen: Arc<Mutex<Option<ConnectionDescriptor>>> = Arc::new(Mutex::new(None));
    let recorder = Arc::clone(&seen);

    let result = AssertUnwindSafe(FIXTURES.with_function_database(move |db| {
        Box::pin(async move {
            *recorder.lock().unwrap() = Some(db.descriptor().clone());
            explode()
        })
    }))
    .catch_unwind()
    .await;
    assert!(result.is_err());

    let descriptor = seen.lock().unwrap().clone().expect("body ran");
    let exists = FIXTURES.lifecycle().database_exists(&descriptor).await.unwrap();
    assert!(!exists);
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_shared_database_is_provisioned_once() {
    let first = FIXTURES.database().await.expect("database");
    let second = FIXTURES.database().await.expect("database");

    assert_eq!(first.name(), second.name());
    assert!(FIXTURES.lifecycle().database_exists(first.descriptor()).await.unwrap());

    first.close().await;
    second.close().await;
}

db_test!(
    #[ignore = "requires PostgreSQL"]
    test_function_database_starts_empty,
    FIXTURES,
    |db| {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM table1")
            .fetch_one(db.pool())
            .await?;
        assert_eq!(count, 0);
        Ok(())
    }
);
