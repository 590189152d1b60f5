//! Row of the fixture relation.

use serde::{Deserialize, Serialize};

/// Serial primary key of an `employee` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EmployeeId(pub i64);

impl std::fmt::Display for EmployeeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One row of `employee (id serial PRIMARY KEY, name text, salary double precision)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Employee {
    pub id: EmployeeId,
    pub name: String,
    pub salary: Option<f64>,
}

impl Employee {
    pub fn new(id: EmployeeId, name: impl Into<String>, salary: Option<f64>) -> Self {
        Self { id, name: name.into(), salary }
    }

    /// `(name, salary)` pair, the shape the ACID checks compare against.
    pub fn pair(&self) -> (String, Option<f64>) {
        (self.name.clone(), self.salary)
    }
}
