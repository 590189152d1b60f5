//! # Verdicts
//!
//! What each anomaly should do at each isolation level, and the comparison
//! of that expectation with what a scenario observed.
//!
//! The expectation matrix is PostgreSQL's:
//!
//! | Anomaly | RU | RC | RR | SER |
//! |---------|----|----|----|-----|
//! | dirty read | prevented¹ | prevented | prevented | prevented |
//! | non-repeatable read | occurs | occurs | prevented | prevented |
//! | lost update | occurs | occurs | aborts | aborts |
//! | read skew | occurs | occurs | prevented | prevented |
//! | write skew | occurs | occurs | occurs | aborts² |
//! | phantom read | occurs | occurs | prevented | prevented |
//!
//! ¹ READ UNCOMMITTED is READ COMMITTED unless the backend says otherwise.
//! ² Only when SERIALIZABLE is serializable snapshot isolation.

use std::fmt;

use serde::Serialize;

use crate::backend::BackendCapabilities;
use crate::tx::IsolationLevel;
use crate::ErrorKind;

// ============================================================================
// Anomaly
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Anomaly {
    DirtyRead,
    NonRepeatableRead,
    LostUpdate,
    ReadSkew,
    WriteSkew,
    PhantomRead,
}

impl Anomaly {
    pub const ALL: [Anomaly; 6] = [
        Anomaly::DirtyRead,
        Anomaly::NonRepeatableRead,
        Anomaly::LostUpdate,
        Anomaly::ReadSkew,
        Anomaly::WriteSkew,
        Anomaly::PhantomRead,
    ];
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Anomaly::DirtyRead => "dirty read",
            Anomaly::NonRepeatableRead => "non-repeatable read",
            Anomaly::LostUpdate => "lost update",
            Anomaly::ReadSkew => "read skew",
            Anomaly::WriteSkew => "write skew",
            Anomaly::PhantomRead => "phantom read",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Expectation
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Expectation {
    /// Both units commit and the anomaly is visible.
    Occurs,
    /// Both units commit and the anomaly is not visible.
    Prevented,
    /// One unit is aborted by the database with this error class.
    Aborts(ErrorKind),
}

impl fmt::Display for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expectation::Occurs => f.write_str("occurs"),
            Expectation::Prevented => f.write_str("prevented"),
            Expectation::Aborts(kind) => write!(f, "aborts with {kind}"),
        }
    }
}

/// Expected behaviour of `anomaly` at `level` on a backend with `caps`.
pub fn expected(anomaly: Anomaly, level: IsolationLevel, caps: BackendCapabilities) -> Expectation {
    use IsolationLevel::*;

    let snapshot = level >= RepeatableRead;
    match anomaly {
        Anomaly::DirtyRead => {
            if level == ReadUncommitted && !caps.read_uncommitted_is_read_committed {
                Expectation::Occurs
            } else {
                Expectation::Prevented
            }
        }
        Anomaly::NonRepeatableRead | Anomaly::ReadSkew | Anomaly::PhantomRead => {
            if snapshot { Expectation::Prevented } else { Expectation::Occurs }
        }
        Anomaly::LostUpdate => {
            if snapshot {
                Expectation::Aborts(ErrorKind::SerializationFailure)
            } else {
                Expectation::Occurs
            }
        }
        Anomaly::WriteSkew => {
            if level == Serializable && caps.serializable_is_ssi {
                Expectation::Aborts(ErrorKind::SerializationFailure)
            } else {
                Expectation::Occurs
            }
        }
    }
}

// ============================================================================
// Observation
// ============================================================================

/// Summary of one scenario run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Observed {
    pub occurred: bool,
    /// Error class of the first unit the database aborted, if any.
    pub aborted: Option<ErrorKind>,
}

impl Observed {
    pub fn matches(&self, expectation: Expectation) -> bool {
        match expectation {
            Expectation::Occurs => self.occurred && self.aborted.is_none(),
            Expectation::Prevented => !self.occurred && self.aborted.is_none(),
            Expectation::Aborts(kind) => !self.occurred && self.aborted == Some(kind),
        }
    }
}

/// Implemented by every anomaly scenario's result.
pub trait Observation {
    fn observed(&self) -> Observed;
}

// ============================================================================
// Verdict
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub anomaly: Anomaly,
    pub level: IsolationLevel,
    pub expected: Expectation,
    pub observed: Observed,
}

impl Verdict {
    pub fn judge(
        anomaly: Anomaly,
        level: IsolationLevel,
        caps: BackendCapabilities,
        observed: Observed,
    ) -> Self {
        Self { anomaly, level, expected: expected(anomaly, level, caps), observed }
    }

    pub fn passed(&self) -> bool {
        self.observed.matches(self.expected)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} at {}: expected {}, observed occurred={} aborted={:?}",
            self.anomaly, self.level, self.expected, self.observed.occurred, self.observed.aborted
        )
    }
}
