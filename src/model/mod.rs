//! # Fixture Model
//!
//! The single relation the scenarios run against, and the values bound
//! to its statements. Pure data, no I/O.

pub mod employee;
pub mod value;

pub use employee::{Employee, EmployeeId};
pub use value::Value;

/// DDL for the fixture relation.
pub const EMPLOYEE_DDL: &str =
    "CREATE TABLE IF NOT EXISTS employee (id serial PRIMARY KEY, name text, salary double precision)";
