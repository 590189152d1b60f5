//! Isolation anomaly procedures.
//!
//! Both units of every scenario run at the requested level. Below
//! REPEATABLE READ the rows are the ones the read-committed runs were
//! written with; at snapshot levels they are the repeatable-read cast.

use serde::Serialize;

use super::{settle, UnitResult};
use crate::backend::{Backend, Session};
use crate::model::{EmployeeId, Value};
use crate::tx::IsolationLevel;
use crate::verdict::{Observation, Observed};
use crate::{Error, ErrorKind, Lab, Result};

fn seeded<const N: usize>(ids: Vec<EmployeeId>) -> Result<[EmployeeId; N]> {
    ids.try_into()
        .map_err(|ids: Vec<EmployeeId>| Error::NotFound(format!("expected {N} seeded rows, got {}", ids.len())))
}

async fn committed_salary<B: Backend>(lab: &Lab<B>, id: EmployeeId) -> Result<f64> {
    lab.scope("verify", async move |u| u.salary_of(id).await).await
}

fn first_abort(first: UnitResult, second: UnitResult) -> Option<ErrorKind> {
    first.err().or(second.err())
}

fn both_committed(first: UnitResult, second: UnitResult) -> bool {
    first.is_ok() && second.is_ok()
}

// ============================================================================
// Dirty read
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirtyRead {
    pub level: IsolationLevel,
    /// Reported by a fresh session before any `SET`.
    pub default_level: IsolationLevel,
    /// Reported after `SET TRANSACTION ISOLATION LEVEL`.
    pub configured_level: IsolationLevel,
    /// What t2 read while t1's update was uncommitted.
    pub read: Option<f64>,
    pub final_salary: f64,
    pub first: UnitResult,
    pub second: UnitResult,
}

const DIRTY_BEFORE: f64 = 2500.0;
const DIRTY_AFTER: f64 = 3500.0;

impl Observation for DirtyRead {
    fn observed(&self) -> Observed {
        Observed {
            occurred: self.read == Some(DIRTY_AFTER),
            aborted: first_abort(self.first, self.second),
        }
    }
}

/// t1 updates and holds the row for two ticks; t2 reads it at tick 1.
pub async fn dirty_read<B: Backend>(lab: &Lab<B>, level: IsolationLevel) -> Result<DirtyRead> {
    lab.reset().await?;
    let (default_level, configured_level, id) = lab
        .scope("seed", async move |u| {
            let default_level = u.show_isolation().await?;
            u.set_isolation(level).await?;
            let configured_level = u.show_isolation().await?;
            let id = u.insert_employee("John Smith", Value::Float(DIRTY_BEFORE)).await?;
            Ok((default_level, configured_level, id))
        })
        .await?;

    let (first, second) = lab
        .interleave()
        .run(
            async move |u| {
                u.set_isolation(level).await?;
                u.set_salary(id, DIRTY_AFTER).await?;
                u.pause(2).await;
                Ok(())
            },
            async move |u| {
                u.pause(1).await;
                u.set_isolation(level).await?;
                u.salary_of(id).await
            },
        )
        .await;
    let (_, first) = settle("t1", first)?;
    let (read, second) = settle("t2", second)?;

    let outcome = DirtyRead {
        level,
        default_level,
        configured_level,
        read,
        final_salary: committed_salary(lab, id).await?,
        first,
        second,
    };
    tracing::info!(%level, read = ?outcome.read, final_salary = outcome.final_salary, "dirty read");
    Ok(outcome)
}

// ============================================================================
// Non-repeatable read
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NonRepeatableRead {
    pub level: IsolationLevel,
    pub first_read: Option<f64>,
    pub second_read: Option<f64>,
    pub final_salary: f64,
    pub first: UnitResult,
    pub second: UnitResult,
}

impl Observation for NonRepeatableRead {
    fn observed(&self) -> Observed {
        Observed {
            occurred: self.first_read.is_some() && self.first_read != self.second_read,
            aborted: first_abort(self.first, self.second),
        }
    }
}

/// t1 reads the same row at tick 0 and tick 2; t2 updates it at tick 1.
pub async fn non_repeatable_read<B: Backend>(
    lab: &Lab<B>,
    level: IsolationLevel,
) -> Result<NonRepeatableRead> {
    let (name, salary) = if level.uses_transaction_snapshot() {
        ("Dep Tunner", 3000.0)
    } else {
        ("Beth Lee", 3500.0)
    };
    lab.reset().await?;
    let [id] = seeded(lab.seed([(name, salary)]).await?)?;

    let (first, second) = lab
        .interleave()
        .run(
            async move |u| {
                u.set_isolation(level).await?;
                let before = u.salary_of(id).await?;
                u.pause(2).await;
                let after = u.salary_of(id).await?;
                Ok((before, after))
            },
            async move |u| {
                u.set_isolation(level).await?;
                u.pause(1).await;
                u.set_salary(id, salary + 1000.0).await
            },
        )
        .await;
    let (reads, first) = settle("t1", first)?;
    let (_, second) = settle("t2", second)?;

    let outcome = NonRepeatableRead {
        level,
        first_read: reads.map(|r| r.0),
        second_read: reads.map(|r| r.1),
        final_salary: committed_salary(lab, id).await?,
        first,
        second,
    };
    tracing::info!(
        %level,
        first_read = ?outcome.first_read,
        second_read = ?outcome.second_read,
        "non-repeatable read"
    );
    Ok(outcome)
}

// ============================================================================
// Lost update
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LostUpdate {
    pub level: IsolationLevel,
    pub initial_salary: f64,
    pub final_salary: f64,
    pub first: UnitResult,
    pub second: UnitResult,
}

impl Observation for LostUpdate {
    /// t1 commits last; if its ×1.1 of the stale value is what remains,
    /// t2's ×1.2 was lost.
    fn observed(&self) -> Observed {
        Observed {
            occurred: both_committed(self.first, self.second)
                && self.final_salary == self.initial_salary * 1.1,
            aborted: first_abort(self.first, self.second),
        }
    }
}

/// t1 reads at tick 0 and writes ×1.1 at tick 3; t2 reads and writes ×1.2 at tick 2.
pub async fn lost_update<B: Backend>(lab: &Lab<B>, level: IsolationLevel) -> Result<LostUpdate> {
    let name = if level.uses_transaction_snapshot() { "Bob Fox" } else { "Mary Castle" };
    let initial_salary = 4000.0;
    lab.reset().await?;
    let [id] = seeded(lab.seed([(name, initial_salary)]).await?)?;

    let (first, second) = lab
        .interleave()
        .run(
            async move |u| {
                u.set_isolation(level).await?;
                let salary = u.salary_of(id).await?;
                u.pause(3).await;
                u.set_salary(id, salary * 1.1).await
            },
            async move |u| {
                u.set_isolation(level).await?;
                u.pause(2).await;
                let salary = u.salary_of(id).await?;
                u.set_salary(id, salary * 1.2).await
            },
        )
        .await;
    let (_, first) = settle("t1", first)?;
    let (_, second) = settle("t2", second)?;

    let outcome = LostUpdate {
        level,
        initial_salary,
        final_salary: committed_salary(lab, id).await?,
        first,
        second,
    };
    tracing::info!(%level, final_salary = outcome.final_salary, first = ?first, "lost update");
    Ok(outcome)
}

// ============================================================================
// Read skew
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadSkew {
    pub level: IsolationLevel,
    /// t1's read of the first row, before t2 ran.
    pub first_read: Option<f64>,
    /// t1's read of the second row, after t2 committed.
    pub second_read: Option<f64>,
    pub final_salaries: (f64, f64),
    pub first: UnitResult,
    pub second: UnitResult,
}

impl Observation for ReadSkew {
    /// Both rows always hold equal salaries, so unequal reads are a state
    /// that never existed.
    fn observed(&self) -> Observed {
        Observed {
            occurred: self.first_read.is_some() && self.first_read != self.second_read,
            aborted: first_abort(self.first, self.second),
        }
    }
}

/// t1 reads row 1 at tick 0 and row 2 at tick 2; t2 sets both at tick 1.
pub async fn read_skew<B: Backend>(lab: &Lab<B>, level: IsolationLevel) -> Result<ReadSkew> {
    let names = if level.uses_transaction_snapshot() {
        ("Eric Wilson", "Roxy Clark")
    } else {
        ("Amanda Lang", "August Morse")
    };
    lab.reset().await?;
    let [e1, e2] = seeded(lab.seed([(names.0, 4000.0), (names.1, 4000.0)]).await?)?;

    let (first, second) = lab
        .interleave()
        .run(
            async move |u| {
                u.set_isolation(level).await?;
                let one = u.salary_of(e1).await?;
                u.pause(2).await;
                let two = u.salary_of(e2).await?;
                Ok((one, two))
            },
            async move |u| {
                u.set_isolation(level).await?;
                u.pause(1).await;
                u.set_salary(e1, 5000.0).await?;
                u.set_salary(e2, 5000.0).await
            },
        )
        .await;
    let (reads, first) = settle("t1", first)?;
    let (_, second) = settle("t2", second)?;

    let outcome = ReadSkew {
        level,
        first_read: reads.map(|r| r.0),
        second_read: reads.map(|r| r.1),
        final_salaries: (committed_salary(lab, e1).await?, committed_salary(lab, e2).await?),
        first,
        second,
    };
    tracing::info!(
        %level,
        first_read = ?outcome.first_read,
        second_read = ?outcome.second_read,
        "read skew"
    );
    Ok(outcome)
}

// ============================================================================
// Write skew
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WriteSkew {
    pub level: IsolationLevel,
    pub initial_salaries: (f64, f64),
    pub final_salaries: (f64, f64),
    pub first: UnitResult,
    pub second: UnitResult,
}

impl Observation for WriteSkew {
    /// Each raise was sized from a total that did not include the other;
    /// both landing means neither decision saw the other's effect.
    fn observed(&self) -> Observed {
        let raised = self.final_salaries.0 > self.initial_salaries.0
            && self.final_salaries.1 > self.initial_salaries.1;
        Observed {
            occurred: both_committed(self.first, self.second) && raised,
            aborted: first_abort(self.first, self.second),
        }
    }
}

/// Both units read `SUM(salary)` and raise one row by a tenth of it:
/// t1 sums at tick 0 and raises row 1 at tick 2, t2 sums and raises row 2
/// at tick 1.
pub async fn write_skew<B: Backend>(lab: &Lab<B>, level: IsolationLevel) -> Result<WriteSkew> {
    let names = if level == IsolationLevel::Serializable {
        ("Dean Knox", "Madison Frey")
    } else {
        ("Selma Bates", "Samuel Bowen")
    };
    let initial_salaries = (5000.0, 9000.0);
    lab.reset().await?;
    let [e1, e2] = seeded(
        lab.seed([(names.0, initial_salaries.0), (names.1, initial_salaries.1)])
            .await?,
    )?;

    let (first, second) = lab
        .interleave()
        .run(
            async move |u| {
                u.set_isolation(level).await?;
                let total = u.total_salary_of_all().await?;
                u.pause(2).await;
                u.raise_salary(e1, total * 0.1).await
            },
            async move |u| {
                u.set_isolation(level).await?;
                u.pause(1).await;
                let total = u.total_salary_of_all().await?;
                u.raise_salary(e2, total * 0.1).await
            },
        )
        .await;
    let (_, first) = settle("t1", first)?;
    let (_, second) = settle("t2", second)?;

    let outcome = WriteSkew {
        level,
        initial_salaries,
        final_salaries: (committed_salary(lab, e1).await?, committed_salary(lab, e2).await?),
        first,
        second,
    };
    tracing::info!(%level, final_salaries = ?outcome.final_salaries, first = ?first, "write skew");
    Ok(outcome)
}

// ============================================================================
// Phantom read
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhantomRead {
    pub level: IsolationLevel,
    pub first_sum: Option<f64>,
    pub second_sum: Option<f64>,
    pub final_sum: f64,
    pub first: UnitResult,
    pub second: UnitResult,
}

impl Observation for PhantomRead {
    fn observed(&self) -> Observed {
        Observed {
            occurred: self.first_sum.is_some() && self.first_sum != self.second_sum,
            aborted: first_abort(self.first, self.second),
        }
    }
}

/// t1 sums at tick 0 and tick 2; t2 inserts a row at tick 1.
pub async fn phantom_read<B: Backend>(lab: &Lab<B>, level: IsolationLevel) -> Result<PhantomRead> {
    let names = if level.uses_transaction_snapshot() {
        ("Rosie Cole", "Iggy Bell", "Hugo Cash")
    } else {
        ("Alan Rock", "Jess Tex", "Emma Crow")
    };
    lab.reset().await?;
    lab.seed([(names.0, 2500.0), (names.1, 3000.0)]).await?;

    let (first, second) = lab
        .interleave()
        .run(
            async move |u| {
                u.set_isolation(level).await?;
                let before = u.total_salary_of_all().await?;
                u.pause(2).await;
                let after = u.total_salary_of_all().await?;
                Ok((before, after))
            },
            async move |u| {
                u.set_isolation(level).await?;
                u.pause(1).await;
                u.insert_employee(names.2, Value::Float(3500.0)).await
            },
        )
        .await;
    let (sums, first) = settle("t1", first)?;
    let (_, second) = settle("t2", second)?;

    let final_sum = lab.scope("verify", async |u| u.total_salary_of_all().await).await?;
    let outcome = PhantomRead {
        level,
        first_sum: sums.map(|s| s.0),
        second_sum: sums.map(|s| s.1),
        final_sum,
        first,
        second,
    };
    tracing::info!(
        %level,
        first_sum = ?outcome.first_sum,
        second_sum = ?outcome.second_sum,
        "phantom read"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_checks_row_count() {
        let [a, b] = seeded::<2>(vec![EmployeeId(1), EmployeeId(2)]).unwrap();
        assert_eq!((a, b), (EmployeeId(1), EmployeeId(2)));
        assert!(seeded::<2>(vec![EmployeeId(1)]).is_err());
    }

    #[test]
    fn test_lost_update_is_not_observed_when_a_unit_aborted() {
        let outcome = LostUpdate {
            level: IsolationLevel::RepeatableRead,
            initial_salary: 4000.0,
            final_salary: 4800.0,
            first: Err(ErrorKind::SerializationFailure),
            second: Ok(()),
        };
        assert_eq!(
            outcome.observed(),
            Observed { occurred: false, aborted: Some(ErrorKind::SerializationFailure) }
        );
    }

    #[test]
    fn test_write_skew_requires_both_raises() {
        let skewed = WriteSkew {
            level: IsolationLevel::RepeatableRead,
            initial_salaries: (5000.0, 9000.0),
            final_salaries: (6400.0, 10400.0),
            first: Ok(()),
            second: Ok(()),
        };
        assert!(skewed.observed().occurred);

        let one_landed = WriteSkew { final_salaries: (5000.0, 10400.0), ..skewed };
        assert!(!one_landed.observed().occurred);
    }
}
