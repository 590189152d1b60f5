//! # Backend Traits
//!
//! This is the contract between the interleaving harness and any database
//! it drives. The harness never sees SQL text or wire messages; it calls the
//! fixed statement set below, and each backend renders it for its engine.
//!
//! ## Implementations
//!
//! | Backend | Module | Description |
//! |---------|--------|-------------|
//! | `MemoryBackend` | `memory` | In-process multi-version reference engine |
//! | `PostgresBackend` | `postgres` | External PostgreSQL via `tokio-postgres` |

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;

use crate::model::{Employee, EmployeeId, Value};
use crate::tx::IsolationLevel;
use crate::{Error, Result};

pub use memory::{MemoryBackend, MemorySession};
#[cfg(feature = "postgres")]
pub use postgres::{PostgresBackend, PostgresSession};

// ============================================================================
// Backend capabilities
// ============================================================================

/// Engine traits that change which anomalies are expected where.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendCapabilities {
    /// READ UNCOMMITTED is silently upgraded to READ COMMITTED.
    pub read_uncommitted_is_read_committed: bool,
    /// SERIALIZABLE detects rw-antidependency cycles (write skew aborts).
    pub serializable_is_ssi: bool,
    /// The harness may stop and start the server through `server_control()`.
    pub restartable: bool,
}

impl Default for BackendCapabilities {
    /// PostgreSQL semantics, no restart control.
    fn default() -> Self {
        Self {
            read_uncommitted_is_read_committed: true,
            serializable_is_ssi: true,
            restartable: false,
        }
    }
}

// ============================================================================
// Backend trait
// ============================================================================

/// A database the harness can open sessions against.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// The session type for this backend.
    type Session: Session;

    /// Short name for logs and reports.
    fn name(&self) -> &'static str;

    /// Open a new session (one connection).
    async fn connect(&self) -> Result<Self::Session>;

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities::default()
    }

    /// Restart handle for the server behind this backend, if the harness
    /// is allowed to control it.
    fn server_control(&self) -> Option<&dyn ServerControl> {
        None
    }
}

// ============================================================================
// Session trait
// ============================================================================

/// One connection with an implicit transaction.
///
/// The first statement issued on a session opens a transaction, which
/// stays open until `commit()` or `rollback()`. After a failed statement
/// the transaction is aborted and every further statement fails with
/// `InvalidTransactionState` until it is rolled back.
#[async_trait]
pub trait Session: Send {
    // ========================================================================
    // Transaction control
    // ========================================================================

    /// `SHOW TRANSACTION ISOLATION LEVEL`
    async fn show_isolation(&mut self) -> Result<IsolationLevel>;

    /// `SET TRANSACTION ISOLATION LEVEL ...`
    ///
    /// Must precede the first data statement of the transaction.
    async fn set_isolation(&mut self, level: IsolationLevel) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;

    // ========================================================================
    // Schema
    // ========================================================================

    /// Create the fixture relation if it does not exist.
    async fn ensure_schema(&mut self) -> Result<()>;

    // ========================================================================
    // Statements
    // ========================================================================

    /// `INSERT INTO employee (name, salary) VALUES ($1, $2) RETURNING id`
    ///
    /// The salary is passed with its own type so a mistyped value is
    /// rejected by the engine, not by the client.
    async fn insert_employee(&mut self, name: &str, salary: Value) -> Result<EmployeeId>;

    /// `SELECT id, name, salary FROM employee WHERE id = $1`
    async fn fetch(&mut self, id: EmployeeId) -> Result<Option<Employee>>;

    /// `SELECT id, name, salary FROM employee WHERE name = $1`, lowest id first.
    async fn find_by_name(&mut self, name: &str) -> Result<Option<Employee>>;

    /// `UPDATE employee SET salary = $1 WHERE id = $2`
    async fn set_salary(&mut self, id: EmployeeId, salary: f64) -> Result<u64>;

    /// `UPDATE employee SET salary = salary + $1 WHERE id = $2`
    async fn raise_salary(&mut self, id: EmployeeId, delta: f64) -> Result<u64>;

    /// `SELECT SUM(salary) FROM employee`
    async fn total_salary(&mut self) -> Result<Option<f64>>;

    /// `SELECT id, name, salary FROM employee ORDER BY id`
    async fn employees(&mut self) -> Result<Vec<Employee>>;

    /// `DELETE FROM employee`
    async fn delete_all(&mut self) -> Result<u64>;

    // ========================================================================
    // Provided
    // ========================================================================

    /// Salary of a row that must exist and carry a value.
    async fn salary_of(&mut self, id: EmployeeId) -> Result<f64> {
        match self.fetch(id).await? {
            Some(Employee { salary: Some(salary), .. }) => Ok(salary),
            Some(_) => Err(Error::NotFound(format!("salary of employee {id} is NULL"))),
            None => Err(Error::NotFound(format!("employee {id}"))),
        }
    }

    /// `SUM(salary)` of a relation that must not be empty.
    async fn total_salary_of_all(&mut self) -> Result<f64> {
        self.total_salary()
            .await?
            .ok_or_else(|| Error::NotFound("salary total of an empty relation".into()))
    }
}

// ============================================================================
// Server control
// ============================================================================

/// Stop/start handle for the database server behind a backend.
///
/// Only what the durability check needs; provisioning servers or containers
/// is not this crate's job.
#[async_trait]
pub trait ServerControl: Send + Sync {
    /// Stop the server. Open sessions are cut off, in-flight transactions lost.
    async fn stop(&self) -> Result<()>;

    async fn start(&self) -> Result<()>;

    /// Full server log so far.
    async fn logs(&self) -> Result<String>;

    /// How many times `needle` appears in the log.
    async fn log_count(&self, needle: &str) -> Result<usize> {
        Ok(self.logs().await?.matches(needle).count())
    }

    /// Poll the log until `needle` has appeared more than `seen` times.
    async fn wait_for_log(&self, needle: &str, seen: usize, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.log_count(needle).await? > seen {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "log line '{needle}' not seen within {timeout:?}"
                )));
            }
            tokio::time::sleep(LOG_POLL_INTERVAL).await;
        }
    }
}

const LOG_POLL_INTERVAL: Duration = Duration::from_millis(100);
