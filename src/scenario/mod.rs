//! # Scenarios
//!
//! Fixed procedures that provoke (or fail to provoke) a transaction
//! property. Each one starts from an empty relation, seeds its own rows,
//! runs its units and reads back the committed state in a fresh session.
//!
//! Scenarios report what happened; deciding whether that was right for a
//! given isolation level is the job of [`crate::verdict`].
//!
//! | Scenario | Units | Timeline (ticks) |
//! |----------|-------|------------------|
//! | `atomicity` | sequential | |
//! | `consistency` | sequential | |
//! | `isolation` | 2 | t1 reads, writes ×1.1 at 4; t2 reads, writes ×1.2 at 2 |
//! | `durability` | sequential | stop / start the server |
//! | `dirty_read` | 2 | t1 writes at 0, commits at 2; t2 reads at 1 |
//! | `non_repeatable_read` | 2 | t1 reads at 0 and 2; t2 writes at 1 |
//! | `lost_update` | 2 | t1 reads at 0, writes at 3; t2 reads and writes at 2 |
//! | `read_skew` | 2 | t1 reads e1 at 0, e2 at 2; t2 writes both at 1 |
//! | `write_skew` | 2 | t1 sums at 0, raises e1 at 2; t2 sums and raises e2 at 1 |
//! | `phantom_read` | 2 | t1 sums at 0 and 2; t2 inserts at 1 |

pub mod acid;
pub mod anomaly;

pub use acid::{atomicity, consistency, durability, isolation};
pub use acid::{Atomicity, Consistency, Durability, Isolation};
pub use anomaly::{dirty_read, lost_update, non_repeatable_read, phantom_read, read_skew, write_skew};
pub use anomaly::{DirtyRead, LostUpdate, NonRepeatableRead, PhantomRead, ReadSkew, WriteSkew};

use crate::backend::Backend;
use crate::tx::IsolationLevel;
use crate::verdict::{Anomaly, Observation, Observed};
use crate::{ErrorKind, Lab, Result};

/// How a unit ended: committed, or the error class that ended it.
pub type UnitResult = std::result::Result<(), ErrorKind>;

/// Run the scenario for `anomaly` at `level` and summarize it.
pub async fn observe<B: Backend>(
    lab: &Lab<B>,
    anomaly: Anomaly,
    level: IsolationLevel,
) -> Result<Observed> {
    let observed = match anomaly {
        Anomaly::DirtyRead => dirty_read(lab, level).await?.observed(),
        Anomaly::NonRepeatableRead => non_repeatable_read(lab, level).await?.observed(),
        Anomaly::LostUpdate => lost_update(lab, level).await?.observed(),
        Anomaly::ReadSkew => read_skew(lab, level).await?.observed(),
        Anomaly::WriteSkew => write_skew(lab, level).await?.observed(),
        Anomaly::PhantomRead => phantom_read(lab, level).await?.observed(),
    };
    Ok(observed)
}

/// Keep expected concurrency failures as data and propagate anything else.
fn settle<T>(unit: &str, result: Result<T>) -> Result<(Option<T>, UnitResult)> {
    match result {
        Ok(value) => Ok((Some(value), Ok(()))),
        Err(err) if matches!(err.kind(), ErrorKind::SerializationFailure | ErrorKind::Deadlock) => {
            tracing::info!(unit, error = %err, "unit aborted by the database");
            Ok((None, Err(err.kind())))
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_settle_keeps_serialization_failures() {
        let failure = Error::database("40001", "could not serialize access due to concurrent update");
        let (value, outcome) = settle::<f64>("t1", Err(failure)).unwrap();
        assert_eq!(value, None);
        assert_eq!(outcome, Err(ErrorKind::SerializationFailure));
    }

    #[test]
    fn test_settle_propagates_other_errors() {
        let err = settle::<f64>("t1", Err(Error::Connection("refused".into()))).unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
        assert_eq!(settle("t1", Ok(3.0)).unwrap(), (Some(3.0), Ok(())));
    }
}
