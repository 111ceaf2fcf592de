use crate::denylist::{Denylist, DenylistMatch};
use crate::error::FailureKind;
use crate::numeric::{NumericFidelityChecker, NumericToken};
use crate::parse::{ParseFailure, ParsedOutput};
use crate::schema::{validate_record, FieldViolation, MarketContextRecord, SchemaLimits};
use crate::snapshot::{Snapshot, StatValue};
use crate::utils::Period;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A `key_stats` entry that does not agree with the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum KeyStatIssue {
    /// The snapshot has no statistic by this name.
    Unknown { name: String, reported: f64 },
    /// The snapshot marks this statistic as unavailable.
    Unavailable { name: String, reported: f64 },
    Mismatch {
        name: String,
        reported: f64,
        expected: f64,
    },
}

impl fmt::Display for KeyStatIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyStatIssue::Unknown { name, reported } => write!(
                f,
                "key_stats.{} = {} is not a snapshot statistic",
                name, reported
            ),
            KeyStatIssue::Unavailable { name, reported } => write!(
                f,
                "key_stats.{} = {} but the snapshot marks it unavailable; remove it and write 'data not available' instead",
                name, reported
            ),
            KeyStatIssue::Mismatch {
                name,
                reported,
                expected,
            } => write!(
                f,
                "key_stats.{} = {} but the snapshot value is {}",
                name, reported, expected
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationFailure {
    ParseFailure { failure: ParseFailure },
    SchemaViolation { violations: Vec<FieldViolation> },
    KeyStatMismatch { issues: Vec<KeyStatIssue> },
    NumericMismatch { unmatched: Vec<NumericToken> },
    DenylistViolation { matches: Vec<DenylistMatch> },
}

impl ValidationFailure {
    pub fn kind(&self) -> FailureKind {
        match self {
            ValidationFailure::ParseFailure { .. } => FailureKind::ParseFailure,
            ValidationFailure::SchemaViolation { .. } => FailureKind::SchemaViolation,
            ValidationFailure::KeyStatMismatch { .. } | ValidationFailure::NumericMismatch { .. } => {
                FailureKind::NumericMismatch
            }
            ValidationFailure::DenylistViolation { .. } => FailureKind::DenylistViolation,
        }
    }

    /// One human-readable line per offending item.
    pub fn reasons(&self) -> Vec<String> {
        match self {
            ValidationFailure::ParseFailure { failure } => {
                vec![format!("output is not a JSON object: {}", failure)]
            }
            ValidationFailure::SchemaViolation { violations } => violations
                .iter()
                .map(|v| format!("schema violation: {}", v))
                .collect(),
            ValidationFailure::KeyStatMismatch { issues } => issues
                .iter()
                .map(|issue| format!("key stat mismatch: {}", issue))
                .collect(),
            ValidationFailure::NumericMismatch { unmatched } => unmatched
                .iter()
                .map(|token| {
                    format!(
                        "numeric mismatch: narrative number '{}' matches no key_stats value",
                        token.text
                    )
                })
                .collect(),
            ValidationFailure::DenylistViolation { matches } => matches
                .iter()
                .map(|m| {
                    format!(
                        "banned phrase '{}' in {} at byte {}",
                        m.phrase, m.field, m.position
                    )
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    /// The typed record, present whenever the candidate passed the schema.
    pub record: Option<MarketContextRecord>,
    pub failures: Vec<ValidationFailure>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.record.is_some() && self.failures.is_empty()
    }

    pub fn kinds(&self) -> Vec<FailureKind> {
        let mut kinds = Vec::new();
        for failure in &self.failures {
            let kind = failure.kind();
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }
        kinds
    }

    pub fn reasons(&self) -> Vec<String> {
        self.failures.iter().flat_map(|f| f.reasons()).collect()
    }

    pub fn parse_failure(&self) -> Option<&ParseFailure> {
        self.failures.iter().find_map(|f| match f {
            ValidationFailure::ParseFailure { failure } => Some(failure),
            _ => None,
        })
    }
}

/// Runs every check on one candidate: schema, key-stat agreement with the
/// snapshot, numeric fidelity of the narrative and the phrase denylist.
#[derive(Debug, Clone, Default)]
pub struct Validator {
    pub limits: SchemaLimits,
    pub numeric: NumericFidelityChecker,
    pub denylist: Denylist,
}

impl Validator {
    pub fn new(limits: SchemaLimits, numeric: NumericFidelityChecker, denylist: Denylist) -> Self {
        Self {
            limits,
            numeric,
            denylist,
        }
    }

    pub fn validate(&self, parsed: &ParsedOutput, period: &Period, snapshot: &Snapshot) -> ValidationReport {
        let candidate = match parsed {
            ParsedOutput::Structured(value) => value,
            ParsedOutput::Failure(failure) => {
                return ValidationReport {
                    record: None,
                    failures: vec![ValidationFailure::ParseFailure {
                        failure: failure.clone(),
                    }],
                };
            }
        };

        let record = match validate_record(candidate, &self.limits, Some(period.label().as_str())) {
            Ok(record) => record,
            Err(violations) => {
                return ValidationReport {
                    record: None,
                    failures: vec![ValidationFailure::SchemaViolation { violations }],
                };
            }
        };

        let failures = self.check_record(&record, period, snapshot);
        ValidationReport {
            record: Some(record),
            failures,
        }
    }

    /// Content checks for a record that already has a valid shape.
    pub fn check_record(
        &self,
        record: &MarketContextRecord,
        period: &Period,
        snapshot: &Snapshot,
    ) -> Vec<ValidationFailure> {
        let mut failures = Vec::new();

        let issues = self.cross_check_key_stats(record, snapshot);
        if !issues.is_empty() {
            failures.push(ValidationFailure::KeyStatMismatch { issues });
        }

        let numeric = self.numeric.check(&record.narrative, &record.key_stats, Some(period));
        if !numeric.passed() {
            failures.push(ValidationFailure::NumericMismatch {
                unmatched: numeric.unmatched,
            });
        }

        let denylist = self.denylist.check_record(record);
        if !denylist.passed() {
            failures.push(ValidationFailure::DenylistViolation {
                matches: denylist.matches,
            });
        }

        failures
    }

    /// Every reported statistic must be a snapshot value. Signs must agree
    /// here even when the narrative check compares magnitudes.
    pub fn cross_check_key_stats(&self, record: &MarketContextRecord, snapshot: &Snapshot) -> Vec<KeyStatIssue> {
        let exact = NumericFidelityChecker {
            sign_sensitive: true,
            ..self.numeric.clone()
        };

        record
            .key_stats
            .iter()
            .filter_map(|(name, &reported)| match snapshot.get(name) {
                None => Some(KeyStatIssue::Unknown {
                    name: name.clone(),
                    reported,
                }),
                Some(StatValue::NotAvailable) => Some(KeyStatIssue::Unavailable {
                    name: name.clone(),
                    reported,
                }),
                Some(StatValue::Value(expected)) if !exact.value_matches(reported, expected) => {
                    Some(KeyStatIssue::Mismatch {
                        name: name.clone(),
                        reported,
                        expected,
                    })
                }
                Some(StatValue::Value(_)) => None,
            })
            .collect()
    }
}
