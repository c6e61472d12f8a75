//! Lock-contention retries for mutating statements.
//!
//! SQLite serializes writers at the file level, so a statement can fail with
//! `SQLITE_BUSY` / `SQLITE_LOCKED` while another process holds the write
//! lock. [`RetryingExecutor`] is the single place that retries such
//! failures: it re-runs an operation with a fixed or linearly growing delay
//! up to a bounded number of attempts, then surfaces
//! [`EngineError::LockContention`]. Any other error is returned immediately.

use std::thread;

use relforge_core::RetryConfig;
use rusqlite::{Connection, Params, Transaction};
use tracing::{debug, warn};

use crate::error::{EngineError, Result, is_lock_error};

/// Runs statements with bounded retries on lock contention.
///
/// # Examples
///
/// ```
/// use relforge_core::RetryConfig;
/// use relforge_sqlite::RetryingExecutor;
/// use rusqlite::Connection;
///
/// let conn = Connection::open_in_memory().unwrap();
/// let executor = RetryingExecutor::new(RetryConfig::default());
/// executor.execute_batch(&conn, "CREATE TABLE t (x INTEGER);").unwrap();
/// executor.execute(&conn, "INSERT INTO t (x) VALUES (?1)", [1]).unwrap();
/// ```
#[derive(Debug, Clone, Default)]
pub struct RetryingExecutor {
    policy: RetryConfig,
}

impl RetryingExecutor {
    /// Creates an executor with the given policy.
    pub fn new(policy: RetryConfig) -> Self {
        Self { policy }
    }

    /// Returns the active policy.
    pub fn policy(&self) -> &RetryConfig {
        &self.policy
    }

    /// Runs `op`, retrying while it fails with a lock error.
    ///
    /// `op` must be safe to repeat: a locked statement has not taken effect.
    pub fn run<T, F>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> rusqlite::Result<T>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if is_lock_error(&err) => {
                    if attempt >= max_attempts {
                        warn!(attempts = attempt, error = %err, "database still locked, giving up");
                        return Err(EngineError::LockContention {
                            attempts: attempt,
                            source: err,
                        });
                    }
                    let delay = self.policy.delay_before(attempt);
                    debug!(attempt, ?delay, "database locked, retrying");
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Executes a single statement, returning the number of changed rows.
    pub fn execute<P>(&self, conn: &Connection, sql: &str, params: P) -> Result<usize>
    where
        P: Params + Clone,
    {
        self.run(|| conn.execute(sql, params.clone()))
    }

    /// Executes one or more `;`-separated statements without parameters.
    pub fn execute_batch(&self, conn: &Connection, sql: &str) -> Result<()> {
        self.run(|| conn.execute_batch(sql))
    }

    /// Opens a deferred transaction on a shared connection.
    ///
    /// The transaction rolls back when dropped without
    /// [`commit`](Transaction::commit).
    pub fn begin<'c>(&self, conn: &'c Connection) -> Result<Transaction<'c>> {
        self.run(|| conn.unchecked_transaction())
    }

    /// Commits `tx`, retrying if the final write lock is contended.
    ///
    /// A failed `COMMIT` leaves the transaction open, so the retry re-issues
    /// it on the same transaction before giving up and rolling back.
    pub fn commit(&self, tx: Transaction<'_>) -> Result<()> {
        self.run(|| tx.execute_batch("COMMIT"))?;
        // The connection is back in autocommit mode, so dropping is a no-op.
        drop(tx);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use relforge_core::Backoff;

    use super::*;

    fn busy() -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY), None)
    }

    fn fast(max_attempts: u32) -> RetryingExecutor {
        RetryingExecutor::new(RetryConfig {
            max_attempts,
            delay_ms: 1,
            backoff: Backoff::Fixed,
        })
    }

    #[test]
    fn test_succeeds_after_transient_lock() {
        let calls = Cell::new(0);
        let value = fast(3)
            .run(|| {
                calls.set(calls.get() + 1);
                if calls.get() < 3 { Err(busy()) } else { Ok(42) }
            })
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let calls = Cell::new(0);
        let result: Result<()> = fast(4).run(|| {
            calls.set(calls.get() + 1);
            Err(busy())
        });
        assert!(matches!(
            result,
            Err(EngineError::LockContention { attempts: 4, .. })
        ));
        assert_eq!(calls.get(), 4);
    }

    #[test]
    fn test_does_not_retry_other_errors() {
        let calls = Cell::new(0);
        let result: Result<()> = fast(5).run(|| {
            calls.set(calls.get() + 1);
            Err(rusqlite::Error::QueryReturnedNoRows)
        });
        assert!(matches!(result, Err(EngineError::DatabaseError(_))));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_execute_and_commit() {
        let conn = Connection::open_in_memory().unwrap();
        let executor = fast(2);
        executor
            .execute_batch(&conn, "CREATE TABLE t (x INTEGER);")
            .unwrap();

        let tx = executor.begin(&conn).unwrap();
        executor
            .execute(&tx, "INSERT INTO t (x) VALUES (?1)", [7])
            .unwrap();
        executor.commit(tx).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_dropped_transaction_rolls_back() {
        let conn = Connection::open_in_memory().unwrap();
        let executor = fast(2);
        executor
            .execute_batch(&conn, "CREATE TABLE t (x INTEGER);")
            .unwrap();
        {
            let tx = executor.begin(&conn).unwrap();
            executor
                .execute(&tx, "INSERT INTO t (x) VALUES (1)", [])
                .unwrap();
        }
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_lock_contention_between_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locked.db");
        let holder = Connection::open(&path).unwrap();
        holder
            .execute_batch("CREATE TABLE t (x INTEGER); BEGIN IMMEDIATE; INSERT INTO t VALUES (1);")
            .unwrap();

        let other = Connection::open(&path).unwrap();
        other
            .busy_timeout(std::time::Duration::from_millis(0))
            .unwrap();
        let result = fast(2).execute(&other, "INSERT INTO t (x) VALUES (2)", []);
        assert!(matches!(
            result,
            Err(EngineError::LockContention { attempts: 2, .. })
        ));

        holder.execute_batch("COMMIT;").unwrap();
        fast(2)
            .execute(&other, "INSERT INTO t (x) VALUES (2)", [])
            .unwrap();
    }
}
