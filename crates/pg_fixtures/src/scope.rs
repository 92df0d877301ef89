//! Scoped acquisition helpers
//!
//! Fixtures run the test body through [`guarded`], perform every teardown
//! step while recording failures in a [`Teardown`], and only then report the
//! outcome with [`finish`]. A panicking body is resumed after teardown, so
//! the test still fails the way the harness expects.

use futures::future::LocalBoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use tracing::warn;

use crate::error::FixtureError;

/// Result of a test body: its own result, or the payload of its panic
pub(crate) type Outcome<T> = Result<anyhow::Result<T>, Box<dyn Any + Send>>;

pub(crate) async fn guarded<T>(body: LocalBoxFuture<'_, anyhow::Result<T>>) -> Outcome<T> {
    AssertUnwindSafe(body).catch_unwind().await
}

/// Collects teardown failures; the first one is reported
#[derive(Debug, Default)]
pub(crate) struct Teardown {
    first: Option<FixtureError>,
}

impl Teardown {
    pub(crate) fn record(&mut self, step: &'static str, result: Result<(), FixtureError>) {
        if let Err(error) = result {
            warn!(step, %error, "Teardown step failed");
            self.first.get_or_insert(error);
        }
    }

    pub(crate) fn record_sql(&mut self, step: &'static str, result: Result<(), sqlx::Error>) {
        self.record(
            step,
            result.map_err(|source| FixtureError::Teardown { step, source }),
        );
    }

    pub(crate) fn is_clean(&self) -> bool {
        self.first.is_none()
    }
}

/// Reports the body's outcome once teardown has run
///
/// A body failure takes precedence over teardown failures, which have
/// already been logged.
pub(crate) fn finish<T>(outcome: Outcome<T>, teardown: Teardown) -> Result<T, FixtureError> {
    match outcome {
        Err(payload) => panic::resume_unwind(payload),
        Ok(Err(error)) => Err(FixtureError::Body(error)),
        Ok(Ok(value)) => match teardown.first {
            Some(error) => Err(error),
            None => Ok(value),
        },
    }
}
