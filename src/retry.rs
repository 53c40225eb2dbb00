//! Bounded retry for transient storage faults.
//!
//! Every call to [`RetryPolicy::run_returning`] gets its own countdown, so one caller's
//! failures never eat into another caller's allowance. Only the two faults described by
//! [`TransientFault`] are retried; anything else is handed back to the caller on the first
//! attempt, with no delay and no log output.

use std::{fmt::Display, future::Future, io, time::Duration};

use sqlx::{Decode, Sqlite, SqlitePool, Type};

use crate::{error::Error, statement::Statement};

/// Primary SQLite result codes (the low byte of an extended code).
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;
/// Extended code: a WAL read snapshot went stale before the write lock could be taken.
const SQLITE_BUSY_SNAPSHOT: i32 = 517;

/// The storage conditions that are expected to clear up on their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum TransientFault {
    /// The statement lost a lock conflict against another writer.
    #[strum(serialize = "deadlock")]
    Deadlock,
    /// The statement (or the wait for a connection) ran out of time.
    #[strum(serialize = "timeout")]
    Timeout,
}

/// Classifies a failure as transient or not.
pub trait Transient {
    fn transient_fault(&self) -> Option<TransientFault>;
}

impl Transient for sqlx::Error {
    fn transient_fault(&self) -> Option<TransientFault> {
        match self {
            sqlx::Error::PoolTimedOut => Some(TransientFault::Timeout),
            sqlx::Error::Io(e) if e.kind() == io::ErrorKind::TimedOut => {
                Some(TransientFault::Timeout)
            }
            sqlx::Error::Database(e) => e.code().as_deref().and_then(classify_sqlite_code),
            _ => None,
        }
    }
}

/// Maps a (possibly extended) SQLite result code to a transient fault.
pub fn classify_sqlite_code(code: &str) -> Option<TransientFault> {
    let code: i32 = code.trim().parse().ok()?;

    if code == SQLITE_BUSY_SNAPSHOT {
        return Some(TransientFault::Deadlock);
    }

    match code & 0xff {
        SQLITE_LOCKED => Some(TransientFault::Deadlock),
        SQLITE_BUSY => Some(TransientFault::Timeout),
        _ => None,
    }
}

/// How many times to retry a transient failure, and how long to wait before each retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_RETRIES, Self::DEFAULT_DELAY)
    }
}

impl RetryPolicy {
    pub const DEFAULT_RETRIES: u32 = 3;
    pub const DEFAULT_DELAY: Duration = Duration::from_secs(2);

    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    /// A policy that surfaces every failure on the first attempt.
    pub fn never() -> Self {
        Self::new(0, Duration::ZERO)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Runs `operation` until it succeeds, fails with a non-transient error, or has been
    /// retried `max_retries` times.
    ///
    /// `operation` is invoked once per attempt, so anything it acquires (connections,
    /// transactions) is acquired fresh for every attempt and released when that attempt's
    /// future completes.
    pub async fn run_returning<T, E, F, Fut>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient + Display,
    {
        let mut remaining = self.max_retries;
        let mut attempt: u32 = 1;

        loop {
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let Some(fault) = err.transient_fault() else {
                return Err(err);
            };

            if remaining == 0 {
                return Err(err);
            }
            remaining -= 1;

            tracing::warn!(
                %fault,
                attempt,
                remaining,
                "{fault} detected, retrying in {:?}: {err}",
                self.delay
            );

            tokio::time::sleep(self.delay).await;
            attempt += 1;
        }
    }

    /// Same as [`RetryPolicy::run_returning`], discarding the value.
    pub async fn run<T, E, F, Fut>(&self, operation: F) -> Result<(), E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient + Display,
    {
        self.run_returning(operation).await.map(|_| ())
    }

    /// Executes a single-value statement on a freshly acquired connection.
    ///
    /// A NULL value or an empty result set maps to `T::default()`.
    pub async fn get_scalar<T>(&self, db: &SqlitePool, statement: &Statement) -> Result<T, Error>
    where
        T: Default + for<'r> Decode<'r, Sqlite> + Type<Sqlite> + Send + Unpin,
    {
        self.run_returning(move || async move {
            let mut conn = db.acquire().await?;

            let value: Option<Option<T>> =
                sqlx::query_scalar_with(statement.sql(), statement.arguments()?)
                    .fetch_optional(&mut *conn)
                    .await?;

            Result::<_, Error>::Ok(value.flatten().unwrap_or_default())
        })
        .await
    }
}
