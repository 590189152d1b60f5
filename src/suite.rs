//! # Conformance Suite
//!
//! Runs every ACID property and every anomaly at every isolation level
//! against one backend, and collects the outcome as a serializable report.

use std::fmt;

use serde::Serialize;

use crate::backend::Backend;
use crate::scenario;
use crate::tx::IsolationLevel;
use crate::verdict::{Anomaly, Verdict};
use crate::{Lab, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AcidProperty {
    Atomicity,
    Consistency,
    Isolation,
    Durability,
}

impl fmt::Display for AcidProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AcidProperty::Atomicity => "atomicity",
            AcidProperty::Consistency => "consistency",
            AcidProperty::Isolation => "isolation",
            AcidProperty::Durability => "durability",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Passed,
    Failed,
    /// The backend cannot run this check (durability without server control).
    Skipped,
}

impl CheckStatus {
    fn from_holds(holds: bool) -> Self {
        if holds { CheckStatus::Passed } else { CheckStatus::Failed }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AcidCheck {
    pub property: AcidProperty,
    pub status: CheckStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConformanceReport {
    pub backend: String,
    pub acid: Vec<AcidCheck>,
    pub isolation: Vec<Verdict>,
}

impl ConformanceReport {
    /// No ACID check failed and every verdict matched its expectation.
    pub fn passed(&self) -> bool {
        self.acid.iter().all(|c| c.status != CheckStatus::Failed)
            && self.isolation.iter().all(Verdict::passed)
    }

    /// One line per failed check or verdict.
    pub fn failures(&self) -> Vec<String> {
        let acid = self
            .acid
            .iter()
            .filter(|c| c.status == CheckStatus::Failed)
            .map(|c| format!("{} does not hold", c.property));
        let isolation = self
            .isolation
            .iter()
            .filter(|v| !v.passed())
            .map(|v| v.to_string());
        acid.chain(isolation).collect()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Run the full suite. Scenarios reset the relation themselves, and the
/// relation is left empty afterwards.
pub async fn run_conformance<B: Backend>(lab: &Lab<B>) -> Result<ConformanceReport> {
    let backend = lab.backend().name();
    let caps = lab.backend().capabilities();
    tracing::info!(backend, ?caps, "conformance run starting");

    let acid = vec![
        AcidCheck {
            property: AcidProperty::Atomicity,
            status: CheckStatus::from_holds(scenario::atomicity(lab).await?.holds()),
        },
        AcidCheck {
            property: AcidProperty::Consistency,
            status: CheckStatus::from_holds(scenario::consistency(lab).await?.holds()),
        },
        AcidCheck {
            property: AcidProperty::Isolation,
            status: CheckStatus::from_holds(scenario::isolation(lab).await?.holds()),
        },
        AcidCheck {
            property: AcidProperty::Durability,
            status: match scenario::durability(lab).await? {
                Some(outcome) => CheckStatus::from_holds(outcome.holds()),
                None => CheckStatus::Skipped,
            },
        },
    ];
    for check in &acid {
        tracing::info!(backend, property = %check.property, status = ?check.status, "acid check");
    }

    let mut isolation = Vec::with_capacity(Anomaly::ALL.len() * IsolationLevel::ALL.len());
    for anomaly in Anomaly::ALL {
        for level in IsolationLevel::ALL {
            let observed = scenario::observe(lab, anomaly, level).await?;
            let verdict = Verdict::judge(anomaly, level, caps, observed);
            if verdict.passed() {
                tracing::info!(backend, %verdict, "verdict");
            } else {
                tracing::warn!(backend, %verdict, "verdict mismatch");
            }
            isolation.push(verdict);
        }
    }

    lab.reset().await?;
    let report = ConformanceReport { backend: backend.to_owned(), acid, isolation };
    tracing::info!(backend, passed = report.passed(), "conformance run finished");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verdict::{Expectation, Observed};
    use crate::ErrorKind;

    fn report(status: CheckStatus, observed: Observed) -> ConformanceReport {
        ConformanceReport {
            backend: "memory".into(),
            acid: vec![AcidCheck { property: AcidProperty::Durability, status }],
            isolation: vec![Verdict {
                anomaly: Anomaly::WriteSkew,
                level: IsolationLevel::Serializable,
                expected: Expectation::Aborts(ErrorKind::SerializationFailure),
                observed,
            }],
        }
    }

    #[test]
    fn test_skipped_check_does_not_fail_report() {
        let aborted = Observed { occurred: false, aborted: Some(ErrorKind::SerializationFailure) };
        let report = report(CheckStatus::Skipped, aborted);
        assert!(report.passed());
        assert!(report.failures().is_empty());
    }

    #[test]
    fn test_failures_name_the_mismatch() {
        let skewed = Observed { occurred: true, aborted: None };
        let report = report(CheckStatus::Failed, skewed);
        assert!(!report.passed());
        let failures = report.failures();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0], "durability does not hold");
        assert!(failures[1].starts_with("write skew at serializable"));
    }

    #[test]
    fn test_report_json_shape() {
        let report = report(CheckStatus::Passed, Observed { occurred: false, aborted: None });
        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["backend"], "memory");
        assert_eq!(json["acid"][0]["status"], "passed");
        assert_eq!(json["isolation"][0]["anomaly"], "write_skew");
        assert_eq!(json["isolation"][0]["level"], "serializable");
    }
}
