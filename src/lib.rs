//! # acid-lab: ACID and Isolation Anomaly Harness
//!
//! Drives two concurrent sessions against a single `employee` relation in a
//! fixed, paced order and reports what each session saw. The same scenarios
//! run against an in-process reference engine or a real PostgreSQL server.
//!
//! ## Design Principles
//!
//! 1. **Trait-first**: `Backend` / `Session` are the contract between the harness and the database
//! 2. **Explicit outcomes**: each unit's result comes back as a `Result`, never through shared state
//! 3. **Ticks, not timestamps**: interleavings are expressed as pauses of whole ticks
//! 4. **Expected failures are data**: serialization failures are observations, not panics
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use acid_lab::{Lab, LabConfig, IsolationLevel};
//! use acid_lab::scenario;
//!
//! # async fn example() -> acid_lab::Result<()> {
//! let lab = Lab::open_memory(LabConfig::default()).await?;
//!
//! let observation = scenario::lost_update(&lab, IsolationLevel::RepeatableRead).await?;
//! assert!(observation.second.is_ok());
//! # Ok(())
//! # }
//! ```
//!
//! ## Backends
//!
//! | Backend | Feature | Description |
//! |---------|---------|-------------|
//! | Memory | (default) | In-process multi-version reference engine |
//! | Postgres | `postgres` | External PostgreSQL via `tokio-postgres` |

// ============================================================================
// Modules
// ============================================================================

pub mod model;
pub mod tx;
pub mod config;
pub mod backend;
pub mod interleave;
pub mod scenario;
pub mod verdict;
pub mod suite;

use std::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// Re-exports
// ============================================================================

pub use model::{Employee, EmployeeId, Value};
pub use tx::{IsolationLevel, TxId};
pub use config::LabConfig;
pub use backend::{Backend, BackendCapabilities, MemoryBackend, ServerControl, Session};
#[cfg(feature = "postgres")]
pub use backend::PostgresBackend;
pub use interleave::{Interleaving, Pace, Unit};
pub use verdict::{Anomaly, Expectation, Observed, Verdict};
pub use suite::{run_conformance, ConformanceReport};

// ============================================================================
// Top-level Lab handle
// ============================================================================

/// The primary entry point. A `Lab` wraps a backend and the harness
/// configuration, and hands out units and interleavings.
pub struct Lab<B: Backend> {
    backend: B,
    config: LabConfig,
}

impl<B: Backend> Lab<B> {
    pub fn with_backend(backend: B, config: LabConfig) -> Self {
        Self { backend, config }
    }

    /// Create the fixture relation if missing.
    pub async fn setup(&self) -> Result<()> {
        self.scope("setup", async |u| u.ensure_schema().await).await
    }

    /// `DELETE FROM employee`; run between scenarios.
    pub async fn reset(&self) -> Result<u64> {
        self.scope("reset", async |u| u.delete_all().await).await
    }

    /// Insert and commit `(name, salary)` rows, returning their ids in order.
    pub async fn seed<I, S>(&self, rows: I) -> Result<Vec<EmployeeId>>
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        let rows: Vec<(String, f64)> = rows.into_iter().map(|(n, s)| (n.into(), s)).collect();
        self.scope("seed", async move |u| {
            let mut ids = Vec::with_capacity(rows.len());
            for (name, salary) in rows {
                ids.push(u.insert_employee(&name, Value::Float(salary)).await?);
            }
            Ok(ids)
        })
        .await
    }

    /// Run `f` as a single unit on a fresh session: commit if it returns
    /// `Ok`, roll back and return the error otherwise.
    pub async fn scope<T, F>(&self, name: &str, f: F) -> Result<T>
    where
        F: AsyncFnOnce(&mut Unit<B::Session>) -> Result<T>,
    {
        interleave::run_unit(&self.backend, name, self.pace(), f).await
    }

    /// Two units on two sessions, started together.
    pub fn interleave(&self) -> Interleaving<'_, B> {
        Interleaving::new(&self.backend, self.pace())
    }

    pub fn pace(&self) -> Pace {
        Pace::new(self.config.tick())
    }

    pub fn config(&self) -> &LabConfig {
        &self.config
    }

    /// Access the underlying backend (for server control and capabilities).
    pub fn backend(&self) -> &B {
        &self.backend
    }
}

/// In-process reference engine, schema created.
impl Lab<MemoryBackend> {
    pub async fn open_memory(config: LabConfig) -> Result<Self> {
        let lab = Self::with_backend(MemoryBackend::new(), config);
        lab.setup().await?;
        Ok(lab)
    }
}

/// PostgreSQL at `config.postgres_url`, schema created.
#[cfg(feature = "postgres")]
impl Lab<PostgresBackend> {
    pub async fn open_postgres(config: LabConfig) -> Result<Self> {
        let url = config
            .postgres_url
            .clone()
            .ok_or_else(|| Error::Config("ACID_LAB_POSTGRES_URL is not set".into()))?;
        let lab = Self::with_backend(PostgresBackend::new(url), config);
        lab.setup().await?;
        Ok(lab)
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Database error {code}: {message}")]
    Database { kind: ErrorKind, code: String, message: String },

    #[error("Transaction error: {0}")]
    TxError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    /// Raised by a unit body to abandon its transaction on purpose.
    #[error("Aborted: {0}")]
    Aborted(String),

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// A server-reported error, classified by its SQLSTATE.
    pub fn database(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        Error::Database {
            kind: ErrorKind::from_sqlstate(&code),
            code,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Connection(_) => ErrorKind::Connection,
            Error::Database { kind, .. } => *kind,
            Error::Aborted(_) => ErrorKind::Application,
            _ => ErrorKind::Other,
        }
    }

    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Database { code, .. } => Some(code),
            _ => None,
        }
    }

    pub fn is_serialization_failure(&self) -> bool {
        self.kind() == ErrorKind::SerializationFailure
    }
}

/// Error class, as far as the scenarios care.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    SerializationFailure,
    Deadlock,
    DataException,
    IntegrityViolation,
    InvalidTransactionState,
    Application,
    Other,
}

impl ErrorKind {
    pub fn from_sqlstate(code: &str) -> Self {
        match code {
            "40001" => ErrorKind::SerializationFailure,
            "40P01" => ErrorKind::Deadlock,
            "42804" => ErrorKind::DataException,
            c if c.starts_with("22") => ErrorKind::DataException,
            c if c.starts_with("23") => ErrorKind::IntegrityViolation,
            c if c.starts_with("25") => ErrorKind::InvalidTransactionState,
            c if c.starts_with("08") || c.starts_with("57P0") => ErrorKind::Connection,
            _ => ErrorKind::Other,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Connection => "connection",
            ErrorKind::SerializationFailure => "serialization_failure",
            ErrorKind::Deadlock => "deadlock",
            ErrorKind::DataException => "data_exception",
            ErrorKind::IntegrityViolation => "integrity_violation",
            ErrorKind::InvalidTransactionState => "invalid_transaction_state",
            ErrorKind::Application => "application",
            ErrorKind::Other => "other",
        };
        f.write_str(s)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlstate_classification() {
        assert_eq!(ErrorKind::from_sqlstate("40001"), ErrorKind::SerializationFailure);
        assert_eq!(ErrorKind::from_sqlstate("40P01"), ErrorKind::Deadlock);
        assert_eq!(ErrorKind::from_sqlstate("42804"), ErrorKind::DataException);
        assert_eq!(ErrorKind::from_sqlstate("22P02"), ErrorKind::DataException);
        assert_eq!(ErrorKind::from_sqlstate("23505"), ErrorKind::IntegrityViolation);
        assert_eq!(ErrorKind::from_sqlstate("25P02"), ErrorKind::InvalidTransactionState);
        assert_eq!(ErrorKind::from_sqlstate("08006"), ErrorKind::Connection);
        assert_eq!(ErrorKind::from_sqlstate("57P01"), ErrorKind::Connection);
        assert_eq!(ErrorKind::from_sqlstate("42P01"), ErrorKind::Other);
    }

    #[test]
    fn test_error_kind_and_sqlstate() {
        let err = Error::database("40001", "could not serialize access due to concurrent update");
        assert!(err.is_serialization_failure());
        assert_eq!(err.sqlstate(), Some("40001"));
        assert_eq!(Error::Aborted("boom".into()).kind(), ErrorKind::Application);
        assert_eq!(Error::Connection("refused".into()).sqlstate(), None);
    }

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::SerializationFailure).unwrap();
        assert_eq!(json, "\"serialization_failure\"");
        assert_eq!(ErrorKind::InvalidTransactionState.to_string(), "invalid_transaction_state");
    }
}
