//! Numeric fidelity: every number in a narrative must come from the statistics.
//!
//! Tokens are decimal numbers with an optional sign, optional thousands
//! separators and an optional `%` suffix. Digits glued to a preceding letter
//! (`Q2`, `S&P500`) or followed by an ordinal suffix (`3rd`) are labels, not
//! statistics, and are skipped.

use crate::utils::Period;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const ORDINAL_SUFFIXES: [&str; 4] = ["st", "nd", "rd", "th"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericToken {
    /// The substring as written, including sign and `%` when present.
    pub text: String,
    pub value: f64,
    /// Byte offset of the token within the scanned text.
    pub offset: usize,
    pub is_percent: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericReport {
    pub tokens_checked: usize,
    pub exempted: Vec<NumericToken>,
    pub unmatched: Vec<NumericToken>,
}

impl NumericReport {
    pub fn passed(&self) -> bool {
        self.unmatched.is_empty()
    }

    pub fn unmatched_texts(&self) -> Vec<&str> {
        self.unmatched.iter().map(|t| t.text.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericFidelityChecker {
    /// Relative tolerance, e.g. `0.01` accepts values within 1% of a statistic.
    pub tolerance: f64,
    /// Skip numbers that exactly equal a numeric component of the period label
    /// (`2025` and `2` for `2025-Q2`). A deliberate leniency for incidental
    /// years and quarter numbers.
    pub exempt_period_components: bool,
    /// When false, magnitudes are compared so "fell 2.1%" matches `-2.1`.
    pub sign_sensitive: bool,
}

impl Default for NumericFidelityChecker {
    fn default() -> Self {
        Self {
            tolerance: 0.01,
            exempt_period_components: true,
            sign_sensitive: false,
        }
    }
}

impl NumericFidelityChecker {
    pub fn new(tolerance: f64) -> Self {
        Self {
            tolerance,
            ..Self::default()
        }
    }

    pub fn check(
        &self,
        narrative: &str,
        key_stats: &BTreeMap<String, f64>,
        period: Option<&Period>,
    ) -> NumericReport {
        let tokens = extract_numbers(narrative);
        let exempt_values: Vec<f64> = match period {
            Some(p) if self.exempt_period_components => p.numeric_components().to_vec(),
            _ => Vec::new(),
        };

        let mut report = NumericReport {
            tokens_checked: tokens.len(),
            exempted: Vec::new(),
            unmatched: Vec::new(),
        };

        for token in tokens {
            if key_stats
                .values()
                .any(|&allowed| self.value_matches(token.value, allowed))
            {
                continue;
            }
            if !token.is_percent && exempt_values.iter().any(|&v| v == token.value) {
                report.exempted.push(token);
                continue;
            }
            report.unmatched.push(token);
        }

        report
    }

    pub fn value_matches(&self, observed: f64, allowed: f64) -> bool {
        if !observed.is_finite() || !allowed.is_finite() {
            return false;
        }
        let (observed, allowed) = if self.sign_sensitive {
            (observed, allowed)
        } else {
            (observed.abs(), allowed.abs())
        };

        if allowed == 0.0 {
            return observed == 0.0;
        }
        (observed - allowed).abs() <= self.tolerance * allowed.abs() + f64::EPSILON
    }
}

pub fn extract_numbers(text: &str) -> Vec<NumericToken> {
    let bytes = text.as_bytes();
    let n = bytes.len();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < n {
        if !bytes[i].is_ascii_digit() {
            i += 1;
            continue;
        }

        let prev = if i > 0 { Some(bytes[i - 1]) } else { None };
        if prev.is_some_and(|p| p.is_ascii_alphabetic() || p == b'_') {
            i = skip_word(bytes, i);
            continue;
        }

        // ".5" is a decimal; the "3" of "1.2.3" or "end.3" is not a new number.
        let leading_dot = prev == Some(b'.');
        if leading_dot && i >= 2 && bytes[i - 2].is_ascii_alphanumeric() {
            i = skip_word(bytes, i);
            continue;
        }
        let lead = if leading_dot { i - 1 } else { i };

        let mut start = lead;
        let mut negative = false;
        let before_lead = if lead > 0 { Some(bytes[lead - 1]) } else { None };
        if let Some(sign @ (b'-' | b'+')) = before_lead {
            let before_sign = if lead >= 2 { Some(bytes[lead - 2]) } else { None };
            let sign_is_standalone = match before_sign {
                None => true,
                Some(b) => b.is_ascii_whitespace() || matches!(b, b'(' | b'[' | b':' | b'"' | b'\''),
            };
            if sign_is_standalone {
                start = lead - 1;
                negative = sign == b'-';
            }
        }

        let mut end = i;
        while end < n && bytes[end].is_ascii_digit() {
            end += 1;
        }
        while !leading_dot
            && end + 4 <= n
            && bytes[end] == b','
            && bytes[end + 1..end + 4].iter().all(u8::is_ascii_digit)
            && (end + 4 == n || !bytes[end + 4].is_ascii_digit())
        {
            end += 4;
        }
        if !leading_dot && end + 1 < n && bytes[end] == b'.' && bytes[end + 1].is_ascii_digit() {
            end += 1;
            while end < n && bytes[end].is_ascii_digit() {
                end += 1;
            }
        }

        if is_ordinal_suffix(&text[end..]) {
            i = skip_word(bytes, end);
            continue;
        }

        let mut digits: String = text[lead..end].chars().filter(|c| *c != ',').collect();
        if leading_dot {
            digits.insert(0, '0');
        }
        let Ok(magnitude) = digits.parse::<f64>() else {
            i = end;
            continue;
        };

        let is_percent = end < n && bytes[end] == b'%';
        let token_end = if is_percent { end + 1 } else { end };

        tokens.push(NumericToken {
            text: text[start..token_end].to_string(),
            value: if negative { -magnitude } else { magnitude },
            offset: start,
            is_percent,
        });
        i = token_end;
    }

    tokens
}

fn skip_word(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_' || bytes[i] == b'.') {
        i += 1;
    }
    i
}

fn is_ordinal_suffix(rest: &str) -> bool {
    let lower = rest
        .chars()
        .take(3)
        .collect::<String>()
        .to_ascii_lowercase();
    ORDINAL_SUFFIXES.iter().any(|suffix| {
        lower.starts_with(suffix)
            && !lower
                .chars()
                .nth(suffix.len())
                .is_some_and(|c| c.is_ascii_alphanumeric())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn values(text: &str) -> Vec<f64> {
        extract_numbers(text).into_iter().map(|t| t.value).collect()
    }

    #[test]
    fn test_extract_basic_forms() {
        assert_eq!(values("returned 11.8 percent"), vec![11.8]);
        assert_eq!(values("the dollar fell -2.1% on the quarter"), vec![-2.1]);
        assert_eq!(values("a (+4.25%) move"), vec![4.25]);
        assert_eq!(values("volume of 2,500,000 shares"), vec![2_500_000.0]);
        assert_eq!(values("cap of $45,000.50"), vec![45_000.5]);
        assert_eq!(values("11.8, 31.2 and 7."), vec![11.8, 31.2, 7.0]);
    }

    #[test]
    fn test_extract_skips_labels() {
        assert_eq!(values("In 2025-Q2 the S&P500 rose"), vec![2025.0]);
        assert_eq!(values("the 3rd straight gain and 21st day"), Vec::<f64>::new());
        assert_eq!(values("range 2023-2024"), vec![2023.0, 2024.0]);
    }

    #[test]
    fn test_leading_dot_decimals() {
        assert_eq!(values("yields slipped .5% on the month"), vec![0.5]);
        assert_eq!(values("a move of -.25 points"), vec![-0.25]);
        assert_eq!(values("version 1.2.3 shipped"), vec![1.2]);

        let tokens = extract_numbers("down .5%");
        assert_eq!(tokens[0].text, ".5%");
        assert_eq!(tokens[0].offset, 5);

        let checker = NumericFidelityChecker::default();
        let report = checker.check("Yields slipped .5% in May.", &stats(&[("yield_chg", 5.0)]), None);
        assert_eq!(report.unmatched_texts(), vec![".5%"]);
        let report = checker.check("Yields slipped .5% in May.", &stats(&[("yield_chg", 0.5)]), None);
        assert!(report.passed());
    }

    #[test]
    fn test_token_text_and_offsets() {
        let tokens = extract_numbers("VIX hit 31.2% then -2.1");
        assert_eq!(tokens[0].text, "31.2%");
        assert!(tokens[0].is_percent);
        assert_eq!(tokens[0].offset, 8);
        assert_eq!(tokens[1].text, "-2.1");
    }

    #[test]
    fn test_scenario_matching_stats_pass() {
        let checker = NumericFidelityChecker::default();
        let key_stats = stats(&[("sp500_tr", 11.8), ("vix_peak", 31.2)]);

        let report = checker.check(
            "The index returned 11.8 percent while the VIX peaked at 31.2.",
            &key_stats,
            None,
        );
        assert!(report.passed());
        assert_eq!(report.tokens_checked, 2);
    }

    #[test]
    fn test_scenario_unknown_number_fails() {
        let checker = NumericFidelityChecker::default();
        let key_stats = stats(&[("sp500_tr", 11.8), ("vix_peak", 31.2)]);

        let report = checker.check(
            "The index returned 12.0 percent while the VIX peaked at 31.2.",
            &key_stats,
            None,
        );
        assert!(!report.passed());
        assert_eq!(report.unmatched_texts(), vec!["12.0"]);
    }

    #[test]
    fn test_tolerance_boundary() {
        let checker = NumericFidelityChecker::new(0.01);
        assert!(checker.value_matches(101.0, 100.0));
        assert!(checker.value_matches(99.0, 100.0));
        assert!(!checker.value_matches(101.5, 100.0));

        let strict = NumericFidelityChecker::new(0.0);
        assert!(strict.value_matches(4.25, 4.25));
        assert!(!strict.value_matches(4.26, 4.25));
    }

    #[test]
    fn test_zero_requires_exact_match() {
        let checker = NumericFidelityChecker::default();
        assert!(checker.value_matches(0.0, 0.0));
        assert!(!checker.value_matches(0.001, 0.0));
    }

    #[test]
    fn test_sign_sensitivity() {
        let lenient = NumericFidelityChecker::default();
        assert!(lenient.value_matches(2.1, -2.1));

        let strict = NumericFidelityChecker {
            sign_sensitive: true,
            ..NumericFidelityChecker::default()
        };
        assert!(!strict.value_matches(2.1, -2.1));
        assert!(strict.value_matches(-2.1, -2.1));
    }

    #[test]
    fn test_period_components_are_exempt_when_enabled() {
        let period = Period::parse("2025-Q2").unwrap();
        let key_stats = stats(&[("sp500_tr", 11.8)]);
        let narrative = "During 2025 the index returned 11.8 percent.";

        let lenient = NumericFidelityChecker::default();
        let report = lenient.check(narrative, &key_stats, Some(&period));
        assert!(report.passed());
        assert_eq!(report.exempted.len(), 1);

        let strict = NumericFidelityChecker {
            exempt_period_components: false,
            ..NumericFidelityChecker::default()
        };
        let report = strict.check(narrative, &key_stats, Some(&period));
        assert_eq!(report.unmatched_texts(), vec!["2025"]);
    }

    #[test]
    fn test_empty_stats_reject_every_number() {
        let checker = NumericFidelityChecker::default();
        let report = checker.check("Rates held at 5.25%.", &BTreeMap::new(), None);
        assert_eq!(report.unmatched_texts(), vec!["5.25%"]);
    }
}
