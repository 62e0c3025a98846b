//! SQLite persistence layer.
//!
//! RULE: Only the store talks to the database.
//! Engines and managers call store methods; they never execute SQL directly.

use crate::error::{DqError, DqResult};
use rusqlite::{Connection, ErrorCode, Transaction, TransactionBehavior};
use std::time::Duration;

mod audit;
mod exception;
mod finding;
mod observation;
mod run;

pub use exception::{ExceptionFilter, ExceptionRecord, NewException};
pub use observation::RiskFactorRecord;
pub use run::RunRecord;

pub struct DqStore {
    conn: Connection,
}

impl DqStore {
    pub fn open(path: &str) -> DqResult<Self> {
        Self::open_with_timeout(path, Duration::from_millis(5000))
    }

    /// Open with an explicit wait for another connection's write lock.
    pub fn open_with_timeout(path: &str, busy_timeout: Duration) -> DqResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only for real files (shared-memory and :memory: ignore it).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(busy_timeout)?;
        Ok(Self { conn })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> DqResult<Self> {
        let conn = Connection::open(":memory:")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn })
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> DqResult<()> {
        self.conn
            .execute_batch(include_str!("../../../migrations/001_foundation.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/002_findings_exceptions.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/003_audit.sql"))?;
        Ok(())
    }

    /// Run `f` inside one write transaction. Commits only when `f` succeeds;
    /// any error rolls everything back.
    ///
    /// The write lock is taken up front (`BEGIN IMMEDIATE`), so reads inside
    /// `f` cannot be overtaken by another connection's commit. A lock that
    /// stays busy past the timeout surfaces as `PersistenceConflict`.
    pub fn atomically<T>(&self, f: impl FnOnce(&Self) -> DqResult<T>) -> DqResult<T> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .map_err(conflict_on("write lock"))?;
        let out = f(self)?;
        tx.commit().map_err(conflict_on("commit"))?;
        Ok(out)
    }
}

/// Map a constraint violation or a lost race for the write lock onto
/// `PersistenceConflict`.
pub(crate) fn conflict_on(key: impl Into<String>) -> impl FnOnce(rusqlite::Error) -> DqError {
    let key = key.into();
    move |e| match &e {
        rusqlite::Error::SqliteFailure(f, _)
            if matches!(
                f.code,
                ErrorCode::ConstraintViolation | ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ) =>
        {
            DqError::PersistenceConflict { key }
        }
        _ => DqError::Database(e),
    }
}
