//! PostgreSQL backend.
//!
//! One `tokio-postgres` client per session, its connection task spawned on
//! the current runtime. Transactions are implicit: the first statement after
//! a commit or rollback is preceded by `BEGIN`.

use async_trait::async_trait;
use bytes::BytesMut;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::{Client, NoTls, Row};

use crate::model::{Employee, EmployeeId, Value, EMPLOYEE_DDL};
use crate::tx::IsolationLevel;
use crate::{Error, Result};
use super::{Backend, Session};

const INSERT: &str = "INSERT INTO employee (name, salary) VALUES ($1, $2) RETURNING id";
const FETCH: &str = "SELECT id, name, salary FROM employee WHERE id = $1::bigint";
const FIND_BY_NAME: &str =
    "SELECT id, name, salary FROM employee WHERE name = $1 ORDER BY id LIMIT 1";
const SET_SALARY: &str = "UPDATE employee SET salary = $1 WHERE id = $2::bigint";
const RAISE_SALARY: &str = "UPDATE employee SET salary = salary + $1 WHERE id = $2::bigint";
const TOTAL_SALARY: &str = "SELECT SUM(salary) FROM employee";
const ALL_EMPLOYEES: &str = "SELECT id, name, salary FROM employee ORDER BY id";
const DELETE_ALL: &str = "DELETE FROM employee";

// ============================================================================
// PostgresBackend
// ============================================================================

pub struct PostgresBackend {
    url: String,
}

impl PostgresBackend {
    /// `url` is passed to the driver unchanged.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Backend for PostgresBackend {
    type Session = PostgresSession;

    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn connect(&self) -> Result<PostgresSession> {
        let (client, connection) = tokio_postgres::connect(&self.url, NoTls).await?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                tracing::debug!(error = %err, "postgres connection closed");
            }
        });
        Ok(PostgresSession { client, in_tx: false })
    }
}

// ============================================================================
// PostgresSession
// ============================================================================

pub struct PostgresSession {
    client: Client,
    in_tx: bool,
}

impl PostgresSession {
    async fn begin_if_needed(&mut self) -> Result<()> {
        if !self.in_tx {
            self.client.batch_execute("BEGIN").await?;
            self.in_tx = true;
        }
        Ok(())
    }

    async fn end(&mut self, command: &str) -> Result<()> {
        if !self.in_tx {
            return Ok(());
        }
        self.in_tx = false;
        self.client.batch_execute(command).await?;
        Ok(())
    }
}

fn employee(row: &Row) -> Result<Employee> {
    let id: i32 = row.try_get(0)?;
    let name: Option<String> = row.try_get(1)?;
    let salary: Option<f64> = row.try_get(2)?;
    Ok(Employee::new(EmployeeId(i64::from(id)), name.unwrap_or_default(), salary))
}

/// Wire type the salary parameter is declared with. The server, not the
/// client, decides whether it fits the column.
fn declared_type(value: &Value) -> Type {
    match value {
        Value::Null | Value::Float(_) => Type::FLOAT8,
        Value::Bool(_) => Type::BOOL,
        Value::Int(_) => Type::INT8,
        Value::Text(_) => Type::TEXT,
        Value::Date(_) => Type::DATE,
    }
}

#[async_trait]
impl Session for PostgresSession {
    async fn show_isolation(&mut self) -> Result<IsolationLevel> {
        self.begin_if_needed().await?;
        let row = self.client.query_one("SHOW TRANSACTION ISOLATION LEVEL", &[]).await?;
        let level: String = row.try_get(0)?;
        level.parse()
    }

    async fn set_isolation(&mut self, level: IsolationLevel) -> Result<()> {
        self.begin_if_needed().await?;
        let sql = format!("SET TRANSACTION ISOLATION LEVEL {}", level.as_sql());
        tracing::debug!(%sql, "postgres");
        self.client.batch_execute(&sql).await?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.end("COMMIT").await
    }

    async fn rollback(&mut self) -> Result<()> {
        self.end("ROLLBACK").await
    }

    async fn ensure_schema(&mut self) -> Result<()> {
        self.begin_if_needed().await?;
        self.client.batch_execute(EMPLOYEE_DDL).await?;
        Ok(())
    }

    async fn insert_employee(&mut self, name: &str, salary: Value) -> Result<EmployeeId> {
        self.begin_if_needed().await?;
        tracing::debug!(name, %salary, "postgres insert");
        let statement = self
            .client
            .prepare_typed(INSERT, &[Type::TEXT, declared_type(&salary)])
            .await?;
        let row = self.client.query_one(&statement, &[&name, &salary]).await?;
        let id: i32 = row.try_get(0)?;
        Ok(EmployeeId(i64::from(id)))
    }

    async fn fetch(&mut self, id: EmployeeId) -> Result<Option<Employee>> {
        self.begin_if_needed().await?;
        let row = self.client.query_opt(FETCH, &[&id.0]).await?;
        row.as_ref().map(employee).transpose()
    }

    async fn find_by_name(&mut self, name: &str) -> Result<Option<Employee>> {
        self.begin_if_needed().await?;
        let row = self.client.query_opt(FIND_BY_NAME, &[&name]).await?;
        row.as_ref().map(employee).transpose()
    }

    async fn set_salary(&mut self, id: EmployeeId, salary: f64) -> Result<u64> {
        self.begin_if_needed().await?;
        tracing::debug!(%id, salary, "postgres update");
        Ok(self.client.execute(SET_SALARY, &[&salary, &id.0]).await?)
    }

    async fn raise_salary(&mut self, id: EmployeeId, delta: f64) -> Result<u64> {
        self.begin_if_needed().await?;
        tracing::debug!(%id, delta, "postgres raise");
        Ok(self.client.execute(RAISE_SALARY, &[&delta, &id.0]).await?)
    }

    async fn total_salary(&mut self) -> Result<Option<f64>> {
        self.begin_if_needed().await?;
        let row = self.client.query_one(TOTAL_SALARY, &[]).await?;
        Ok(row.try_get(0)?)
    }

    async fn employees(&mut self) -> Result<Vec<Employee>> {
        self.begin_if_needed().await?;
        let rows = self.client.query(ALL_EMPLOYEES, &[]).await?;
        rows.iter().map(employee).collect()
    }

    async fn delete_all(&mut self) -> Result<u64> {
        self.begin_if_needed().await?;
        Ok(self.client.execute(DELETE_ALL, &[]).await?)
    }
}

// ============================================================================
// Driver glue
// ============================================================================

impl From<tokio_postgres::Error> for Error {
    fn from(err: tokio_postgres::Error) -> Self {
        if let Some(db) = err.as_db_error() {
            return Error::database(db.code().code(), db.message());
        }
        let io_failure = std::error::Error::source(&err).is_some_and(|s| s.is::<std::io::Error>());
        if err.is_closed() || io_failure {
            Error::Connection(err.to_string())
        } else {
            Error::Driver(err.to_string())
        }
    }
}

impl ToSql for Value {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(b) => b.to_sql(ty, out),
            Value::Int(i) => i.to_sql(ty, out),
            Value::Float(f) => f.to_sql(ty, out),
            Value::Text(s) => s.to_sql(ty, out),
            Value::Date(d) => d.to_sql(ty, out),
        }
    }

    /// The statement is prepared with the value's own type.
    fn accepts(_: &Type) -> bool {
        true
    }

    to_sql_checked!();
}
