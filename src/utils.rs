use crate::error::{MarketContextError, Result};
use chrono::{Days, NaiveDate};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A calendar quarter label such as `2025-Q2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Period {
    pub year: i32,
    pub quarter: u32,
}

impl Period {
    pub fn new(year: i32, quarter: u32) -> Result<Self> {
        if !(1..=4).contains(&quarter) || !(1000..=9999).contains(&year) {
            return Err(MarketContextError::InvalidPeriod(format!(
                "{}-Q{}",
                year, quarter
            )));
        }
        Ok(Self { year, quarter })
    }

    /// Parses a period string in the format "YYYY-QN"
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = || MarketContextError::InvalidPeriod(raw.to_string());

        let (year_part, quarter_part) = raw.trim().split_once("-Q").ok_or_else(invalid)?;

        if year_part.len() != 4 || !year_part.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        if quarter_part.len() != 1 {
            return Err(invalid());
        }

        let year: i32 = year_part.parse().map_err(|_| invalid())?;
        let quarter: u32 = quarter_part.parse().map_err(|_| invalid())?;

        Self::new(year, quarter).map_err(|_| invalid())
    }

    pub fn label(&self) -> String {
        format!("{:04}-Q{}", self.year, self.quarter)
    }

    pub fn first_month(&self) -> u32 {
        (self.quarter - 1) * 3 + 1
    }

    pub fn start_date(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.first_month(), 1)
            .unwrap_or(NaiveDate::MIN)
    }

    pub fn end_date(&self) -> NaiveDate {
        last_day_of_month(self.year, self.first_month() + 2)
    }

    /// Months covered by the quarter, e.g. "April to June 2025".
    pub fn month_span(&self) -> String {
        format!(
            "{} to {}",
            self.start_date().format("%B"),
            self.end_date().format("%B %Y")
        )
    }

    /// The numbers that appear literally in the label, e.g. `[2025, 2]` for `2025-Q2`.
    pub fn numeric_components(&self) -> [f64; 2] {
        [self.year as f64, self.quarter as f64]
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl FromStr for Period {
    type Err = MarketContextError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for Period {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.label())
    }
}

impl<'de> Deserialize<'de> for Period {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Period::parse(&raw).map_err(serde::de::Error::custom)
    }
}

pub fn last_day_of_month(year: i32, month: u32) -> NaiveDate {
    let next_month = if month == 12 { 1 } else { month + 1 };
    let next_year = if month == 12 { year + 1 } else { year };

    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.checked_sub_days(Days::new(1)))
        .unwrap_or(NaiveDate::MAX)
}

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Cuts `text` to at most `max_chars` characters on a char boundary, for log excerpts.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    let mut out: String = text.chars().take(max_chars).collect();
    if text.chars().count() > max_chars {
        out.push_str("...");
    }
    out
}

/// Rough token estimate used for rate limiting (about four characters per token).
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() / 4) as u64
}
