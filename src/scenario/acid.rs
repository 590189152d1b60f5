//! ACID property procedures.

use chrono::NaiveDate;
use serde::Serialize;

use crate::backend::{Backend, Session};
use crate::model::{Employee, Value};
use crate::{Error, ErrorKind, Lab, Result};

type Row = (String, Option<f64>);

fn row(name: &str, salary: f64) -> Row {
    (name.to_owned(), Some(salary))
}

async fn committed_rows<B: Backend>(lab: &Lab<B>) -> Result<Vec<Row>> {
    let rows = lab.scope("verify", async |u| u.employees().await).await?;
    Ok(rows.iter().map(|e| e.pair()).collect())
}

/// A date, which the `double precision` salary column must refuse.
fn mistyped_salary() -> Value {
    NaiveDate::from_ymd_opt(2024, 12, 20).map_or(Value::Text("2024-12-20".into()), Value::Date)
}

// ============================================================================
// Atomicity
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Atomicity {
    /// How the abandoned transaction ended.
    pub failure: Option<ErrorKind>,
    pub rows: Vec<Row>,
}

impl Atomicity {
    pub fn holds(&self) -> bool {
        self.failure.is_some() && self.rows == [row("John Smith", 2500.0)]
    }
}

/// One committed insert, then a transaction that inserts and gives up.
pub async fn atomicity<B: Backend>(lab: &Lab<B>) -> Result<Atomicity> {
    lab.reset().await?;
    lab.seed([("John Smith", 2500.0)]).await?;

    let abandoned = lab
        .scope("abandon", async |u| {
            u.insert_employee("Beth Lee", Value::Float(3500.0)).await?;
            Err::<(), _>(Error::Aborted("application error after insert".into()))
        })
        .await;
    let failure = abandoned.err().map(|e| e.kind());

    let rows = committed_rows(lab).await?;
    tracing::info!(?failure, rows = rows.len(), "atomicity");
    Ok(Atomicity { failure, rows })
}

// ============================================================================
// Consistency
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Consistency {
    /// Lone insert of a mistyped salary.
    pub lone_failure: Option<ErrorKind>,
    /// Valid insert followed by a mistyped one in the same transaction.
    pub batch_failure: Option<ErrorKind>,
    pub rows: Vec<Row>,
}

impl Consistency {
    pub fn holds(&self) -> bool {
        self.lone_failure.is_some()
            && self.batch_failure.is_some()
            && self.rows == [row("Dep Tunner", 3000.0)]
    }
}

pub async fn consistency<B: Backend>(lab: &Lab<B>) -> Result<Consistency> {
    lab.reset().await?;
    lab.seed([("Dep Tunner", 3000.0)]).await?;

    let lone = lab
        .scope("lone", async |u| u.insert_employee("Mary Castle", mistyped_salary()).await)
        .await;
    let batch = lab
        .scope("batch", async |u| {
            u.insert_employee("Bob Fox", Value::Float(2750.0)).await?;
            u.insert_employee("Alan Rock", mistyped_salary()).await
        })
        .await;

    let outcome = Consistency {
        lone_failure: lone.err().map(|e| e.kind()),
        batch_failure: batch.err().map(|e| e.kind()),
        rows: committed_rows(lab).await?,
    };
    tracing::info!(
        lone = ?outcome.lone_failure,
        batch = ?outcome.batch_failure,
        rows = outcome.rows.len(),
        "consistency"
    );
    Ok(outcome)
}

// ============================================================================
// Isolation
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Isolation {
    pub final_salary: f64,
}

impl Isolation {
    /// Both read-modify-write units started from 4000; the later commit wins.
    pub fn holds(&self) -> bool {
        self.final_salary == 4400.0
    }
}

/// Two read-modify-write units at the session default level.
pub async fn isolation<B: Backend>(lab: &Lab<B>) -> Result<Isolation> {
    lab.reset().await?;
    lab.seed([("Jess Tex", 4000.0)]).await?;

    let (first, second) = lab
        .interleave()
        .run(
            async |u| {
                let e = found("Jess Tex", u.find_by_name("Jess Tex").await?)?;
                u.pause(4).await;
                u.set_salary(e.id, salary(&e)? * 1.1).await
            },
            async |u| {
                u.pause(2).await;
                let e = found("Jess Tex", u.find_by_name("Jess Tex").await?)?;
                u.set_salary(e.id, salary(&e)? * 1.2).await
            },
        )
        .await;
    first?;
    second?;

    let final_salary = lab
        .scope("verify", async |u| salary(&found("Jess Tex", u.find_by_name("Jess Tex").await?)?))
        .await?;
    tracing::info!(final_salary, "isolation");
    Ok(Isolation { final_salary })
}

fn found(name: &str, employee: Option<Employee>) -> Result<Employee> {
    employee.ok_or_else(|| Error::NotFound(format!("employee '{name}'")))
}

fn salary(employee: &Employee) -> Result<f64> {
    employee
        .salary
        .ok_or_else(|| Error::NotFound(format!("salary of employee {}", employee.id)))
}

// ============================================================================
// Durability
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Durability {
    /// How a connection attempt failed while the server was down.
    pub refused: Option<ErrorKind>,
    pub rows: Vec<Row>,
}

impl Durability {
    pub fn holds(&self) -> bool {
        self.refused == Some(ErrorKind::Connection) && self.rows == [row("Paul Port", 3000.0)]
    }
}

/// Commit, restart the server, read back. `None` unless the backend is
/// restartable and hands out server control.
pub async fn durability<B: Backend>(lab: &Lab<B>) -> Result<Option<Durability>> {
    let control = lab
        .backend()
        .server_control()
        .filter(|_| lab.backend().capabilities().restartable);
    let Some(control) = control else {
        tracing::info!(backend = lab.backend().name(), "durability skipped: not restartable");
        return Ok(None);
    };
    let config = lab.config();

    lab.reset().await?;
    lab.seed([("Paul Port", 3000.0)]).await?;

    let seen = control.log_count(&config.ready_log_line).await?;
    control.stop().await?;
    let refused = lab.backend().connect().await.err().map(|e| e.kind());

    control.start().await?;
    control
        .wait_for_log(&config.ready_log_line, seen, config.ready_timeout())
        .await?;

    let rows = committed_rows(lab).await?;
    tracing::info!(?refused, rows = rows.len(), "durability");
    Ok(Some(Durability { refused, rows }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendCapabilities, MemoryBackend, MemorySession, ServerControl};
    use crate::LabConfig;

    /// Memory engine that hands out its control handle but claims it
    /// cannot be restarted.
    struct Pinned(MemoryBackend);

    #[async_trait::async_trait]
    impl Backend for Pinned {
        type Session = MemorySession;

        fn name(&self) -> &'static str {
            "pinned"
        }

        async fn connect(&self) -> Result<MemorySession> {
            self.0.connect().await
        }

        fn capabilities(&self) -> BackendCapabilities {
            BackendCapabilities { restartable: false, ..self.0.capabilities() }
        }

        fn server_control(&self) -> Option<&dyn ServerControl> {
            self.0.server_control()
        }
    }

    #[test]
    fn test_mistyped_salary_is_a_date() {
        assert_eq!(mistyped_salary().type_name(), "date");
    }

    #[tokio::test]
    async fn test_atomicity_holds_on_memory() {
        let lab = Lab::open_memory(LabConfig::default()).await.unwrap();
        let outcome = atomicity(&lab).await.unwrap();
        assert_eq!(outcome.failure, Some(ErrorKind::Application));
        assert!(outcome.holds());
    }

    #[tokio::test]
    async fn test_durability_skipped_when_not_restartable() {
        let lab = Lab::with_backend(Pinned(MemoryBackend::new()), LabConfig::default());
        lab.setup().await.unwrap();
        assert_eq!(durability(&lab).await.unwrap(), None);

        let log = lab.backend().0.logs().await.unwrap();
        assert!(!log.contains("shut down"));
    }

    #[test]
    fn test_isolation_holds_only_for_4400() {
        assert!(Isolation { final_salary: 4400.0 }.holds());
        assert!(!Isolation { final_salary: 4800.0 }.holds());
    }
}
