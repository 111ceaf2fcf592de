use crate::utils::word_count;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct MarketContextRecord {
    #[schemars(description = "The reporting period this context covers, formatted YYYY-QN (e.g. '2025-Q2')")]
    pub period: String,

    #[schemars(description = "One-sentence headline summarizing the quarter. Plain, factual, no forecasts.")]
    pub headline: String,

    #[schemars(
        description = "The main macroeconomic drivers of the period, most important first. Each entry is a short phrase."
    )]
    pub macro_drivers: Vec<String>,

    #[schemars(
        description = "Statistic name to value, copied exactly from the supplied snapshot. Only statistics that appear in the snapshot may be listed; unavailable statistics must be omitted."
    )]
    pub key_stats: BTreeMap<String, f64>,

    #[schemars(
        description = "The market context narrative. Every number in it must be one of the key_stats values. Describe the past only."
    )]
    pub narrative: String,

    #[schemars(description = "Document or data source identifiers backing the narrative")]
    pub sources: Vec<String>,
}

impl MarketContextRecord {
    pub fn generate_json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(MarketContextRecord)
    }

    pub fn schema_as_json() -> Result<String, serde_json::Error> {
        let schema = Self::generate_json_schema();
        serde_json::to_string_pretty(&schema)
    }
}

/// Structural bounds enforced by [`validate_record`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaLimits {
    pub headline_max_words: usize,
    pub macro_drivers_min: usize,
    pub macro_drivers_max: usize,
    pub driver_max_words: usize,
    pub narrative_min_words: usize,
    pub narrative_max_words: usize,
    pub sources_min: usize,
}

impl Default for SchemaLimits {
    fn default() -> Self {
        Self {
            headline_max_words: 20,
            macro_drivers_min: 2,
            macro_drivers_max: 5,
            driver_max_words: 20,
            narrative_min_words: 10,
            narrative_max_words: 250,
            sources_min: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Constraint {
    Missing,
    WrongType { expected: String },
    TooFewItems { min: usize, actual: usize },
    TooManyItems { max: usize, actual: usize },
    TooFewWords { min: usize, actual: usize },
    TooManyWords { max: usize, actual: usize },
    EmptyEntry,
    PeriodMismatch { expected: String, actual: String },
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constraint::Missing => write!(f, "required field is missing"),
            Constraint::WrongType { expected } => write!(f, "expected {}", expected),
            Constraint::TooFewItems { min, actual } => {
                write!(f, "has {} items, minimum is {}", actual, min)
            }
            Constraint::TooManyItems { max, actual } => {
                write!(f, "has {} items, maximum is {}", actual, max)
            }
            Constraint::TooFewWords { min, actual } => {
                write!(f, "has {} words, minimum is {}", actual, min)
            }
            Constraint::TooManyWords { max, actual } => {
                write!(f, "has {} words, maximum is {}", actual, max)
            }
            Constraint::EmptyEntry => write!(f, "must not be empty"),
            Constraint::PeriodMismatch { expected, actual } => {
                write!(f, "is '{}' but the requested period is '{}'", actual, expected)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldViolation {
    pub field: String,
    pub constraint: Constraint,
}

impl FieldViolation {
    fn new(field: impl Into<String>, constraint: Constraint) -> Self {
        Self {
            field: field.into(),
            constraint,
        }
    }
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.constraint)
    }
}

/// Checks an untrusted candidate against the record shape and `limits`.
///
/// Every violation is collected rather than stopping at the first one, so a
/// revision prompt can name all of them. Nothing is coerced: a number encoded
/// as a string is a type error and a missing field is never defaulted.
pub fn validate_record(
    candidate: &Value,
    limits: &SchemaLimits,
    expected_period: Option<&str>,
) -> Result<MarketContextRecord, Vec<FieldViolation>> {
    let Some(obj) = candidate.as_object() else {
        return Err(vec![FieldViolation::new(
            "$",
            Constraint::WrongType {
                expected: "object".to_string(),
            },
        )]);
    };

    let mut violations = Vec::new();

    if let Some(period) = require_str(obj, "period", &mut violations) {
        if period.trim().is_empty() {
            violations.push(FieldViolation::new("period", Constraint::EmptyEntry));
        } else if let Some(expected) = expected_period {
            if period.trim() != expected {
                violations.push(FieldViolation::new(
                    "period",
                    Constraint::PeriodMismatch {
                        expected: expected.to_string(),
                        actual: period.to_string(),
                    },
                ));
            }
        }
    }

    if let Some(headline) = require_str(obj, "headline", &mut violations) {
        check_words("headline", headline, 1, limits.headline_max_words, &mut violations);
    }

    if let Some(drivers) = require_string_array(obj, "macro_drivers", &mut violations) {
        check_count(
            "macro_drivers",
            drivers.len(),
            limits.macro_drivers_min,
            limits.macro_drivers_max,
            &mut violations,
        );
        for (idx, driver) in drivers.iter().enumerate() {
            check_words(
                &format!("macro_drivers[{}]", idx),
                driver,
                1,
                limits.driver_max_words,
                &mut violations,
            );
        }
    }

    match obj.get("key_stats") {
        None | Some(Value::Null) => {
            violations.push(FieldViolation::new("key_stats", Constraint::Missing))
        }
        Some(Value::Object(stats)) => {
            for (name, value) in stats {
                if !value.is_number() {
                    violations.push(FieldViolation::new(
                        format!("key_stats.{}", name),
                        Constraint::WrongType {
                            expected: "number".to_string(),
                        },
                    ));
                }
            }
        }
        Some(_) => violations.push(FieldViolation::new(
            "key_stats",
            Constraint::WrongType {
                expected: "object of numbers".to_string(),
            },
        )),
    }

    if let Some(narrative) = require_str(obj, "narrative", &mut violations) {
        check_words(
            "narrative",
            narrative,
            limits.narrative_min_words,
            limits.narrative_max_words,
            &mut violations,
        );
    }

    if let Some(sources) = require_string_array(obj, "sources", &mut violations) {
        check_count(
            "sources",
            sources.len(),
            limits.sources_min,
            usize::MAX,
            &mut violations,
        );
        for (idx, source) in sources.iter().enumerate() {
            if source.trim().is_empty() {
                violations.push(FieldViolation::new(
                    format!("sources[{}]", idx),
                    Constraint::EmptyEntry,
                ));
            }
        }
    }

    if !violations.is_empty() {
        return Err(violations);
    }

    serde_json::from_value(candidate.clone()).map_err(|e| {
        vec![FieldViolation::new(
            "$",
            Constraint::WrongType {
                expected: format!("market context record ({})", e),
            },
        )]
    })
}

fn require_str<'a>(
    obj: &'a Map<String, Value>,
    field: &str,
    violations: &mut Vec<FieldViolation>,
) -> Option<&'a str> {
    match obj.get(field) {
        None | Some(Value::Null) => {
            violations.push(FieldViolation::new(field, Constraint::Missing));
            None
        }
        Some(Value::String(s)) => Some(s.as_str()),
        Some(_) => {
            violations.push(FieldViolation::new(
                field,
                Constraint::WrongType {
                    expected: "string".to_string(),
                },
            ));
            None
        }
    }
}

fn require_string_array<'a>(
    obj: &'a Map<String, Value>,
    field: &str,
    violations: &mut Vec<FieldViolation>,
) -> Option<Vec<&'a str>> {
    let items = match obj.get(field) {
        None | Some(Value::Null) => {
            violations.push(FieldViolation::new(field, Constraint::Missing));
            return None;
        }
        Some(Value::Array(items)) => items,
        Some(_) => {
            violations.push(FieldViolation::new(
                field,
                Constraint::WrongType {
                    expected: "array of strings".to_string(),
                },
            ));
            return None;
        }
    };

    let mut strings = Vec::with_capacity(items.len());
    let mut well_typed = true;
    for (idx, item) in items.iter().enumerate() {
        match item.as_str() {
            Some(s) => strings.push(s),
            None => {
                well_typed = false;
                violations.push(FieldViolation::new(
                    format!("{}[{}]", field, idx),
                    Constraint::WrongType {
                        expected: "string".to_string(),
                    },
                ));
            }
        }
    }

    well_typed.then_some(strings)
}

fn check_count(
    field: &str,
    actual: usize,
    min: usize,
    max: usize,
    violations: &mut Vec<FieldViolation>,
) {
    if actual < min {
        violations.push(FieldViolation::new(
            field,
            Constraint::TooFewItems { min, actual },
        ));
    } else if actual > max {
        violations.push(FieldViolation::new(
            field,
            Constraint::TooManyItems { max, actual },
        ));
    }
}

fn check_words(
    field: &str,
    text: &str,
    min: usize,
    max: usize,
    violations: &mut Vec<FieldViolation>,
) {
    let actual = word_count(text);
    if actual == 0 {
        violations.push(FieldViolation::new(field, Constraint::EmptyEntry));
    } else if actual < min {
        violations.push(FieldViolation::new(
            field,
            Constraint::TooFewWords { min, actual },
        ));
    } else if actual > max {
        violations.push(FieldViolation::new(
            field,
            Constraint::TooManyWords { max, actual },
        ));
    }
}
