//! End-to-end ACID checks against the in-process reference backend.
//!
//! Timed scenarios run on a paused tokio clock, so a tick costs nothing and
//! the unit ordering is exact.

mod common;

use acid_lab::scenario;
use acid_lab::{Backend, ErrorKind, Lab, LabConfig, Session, Value};
use pretty_assertions::assert_eq;

fn row(name: &str, salary: f64) -> (String, Option<f64>) {
    (name.to_owned(), Some(salary))
}

// ============================================================================
// 1. Atomicity: an abandoned transaction leaves nothing behind
// ============================================================================

#[tokio::test]
async fn test_atomicity() {
    let lab = common::memory_lab().await;
    let outcome = scenario::atomicity(&lab).await.unwrap();

    assert_eq!(outcome.failure, Some(ErrorKind::Application));
    assert_eq!(outcome.rows, vec![row("John Smith", 2500.0)]);
    assert!(outcome.holds());
}

// ============================================================================
// 2. Consistency: mistyped salaries are refused, batch and all
// ============================================================================

#[tokio::test]
async fn test_consistency() {
    let lab = common::memory_lab().await;
    let outcome = scenario::consistency(&lab).await.unwrap();

    assert_eq!(outcome.lone_failure, Some(ErrorKind::DataException));
    assert_eq!(outcome.batch_failure, Some(ErrorKind::DataException));
    assert_eq!(outcome.rows, vec![row("Dep Tunner", 3000.0)]);
    assert!(outcome.holds());
}

#[tokio::test]
async fn test_integer_salary_is_accepted() {
    let lab = common::memory_lab().await;
    let id = lab
        .scope("insert", async |u| u.insert_employee("Bob Fox", Value::Int(2750)).await)
        .await
        .unwrap();
    let salary = lab.scope("read", async move |u| u.salary_of(id).await).await.unwrap();
    assert_eq!(salary, 2750.0);
}

// ============================================================================
// 3. Isolation: concurrent read-modify-write, last commit wins
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_isolation() {
    let lab = common::memory_lab().await;
    let outcome = scenario::isolation(&lab).await.unwrap();
    assert_eq!(outcome.final_salary, 4400.0);
    assert!(outcome.holds());
}

#[tokio::test(start_paused = true)]
async fn test_isolation_with_short_tick() {
    common::init_tracing();
    let config = LabConfig::default().with_tick(std::time::Duration::from_millis(10));
    let lab = Lab::open_memory(config).await.unwrap();
    assert_eq!(scenario::isolation(&lab).await.unwrap().final_salary, 4400.0);
}

// ============================================================================
// 4. Durability: committed rows survive a server restart
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_durability() {
    let lab = common::memory_lab().await;
    let outcome = scenario::durability(&lab).await.unwrap().unwrap();

    assert_eq!(outcome.refused, Some(ErrorKind::Connection));
    assert_eq!(outcome.rows, vec![row("Paul Port", 3000.0)]);
    assert!(outcome.holds());
}

#[tokio::test(start_paused = true)]
async fn test_durability_loses_in_flight_transaction() {
    let lab = common::memory_lab().await;
    let control = lab.backend().server_control().unwrap();

    let mut in_flight = lab.backend().connect().await.unwrap();
    in_flight.insert_employee("Paul Port", Value::Float(3000.0)).await.unwrap();
    control.stop().await.unwrap();
    control.start().await.unwrap();

    assert_eq!(in_flight.commit().await.unwrap_err().kind(), ErrorKind::Connection);
    let rows = lab.scope("read", async |u| u.employees().await).await.unwrap();
    assert!(rows.is_empty());
}
