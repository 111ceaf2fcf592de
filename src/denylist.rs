use crate::schema::MarketContextRecord;
use serde::{Deserialize, Serialize};

/// Forward-looking and advisory phrasing that must never reach a published
/// market context.
pub const DEFAULT_BANNED_PHRASES: &[&str] = &[
    "we expect",
    "we anticipate",
    "we believe",
    "we predict",
    "we forecast",
    "we recommend",
    "is expected to",
    "are expected to",
    "will likely",
    "is likely to",
    "are likely to",
    "going forward",
    "in the coming months",
    "next quarter",
    "investors should",
    "you should",
    "should consider buying",
    "should consider selling",
    "buy recommendation",
    "sell recommendation",
    "price target",
    "guaranteed",
    "poised to",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenylistMatch {
    /// The configured phrase that matched.
    pub phrase: String,
    pub field: String,
    /// Byte offset of the match within the field's text.
    pub position: usize,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DenylistReport {
    pub matches: Vec<DenylistMatch>,
}

impl DenylistReport {
    pub fn passed(&self) -> bool {
        self.matches.is_empty()
    }

    /// Distinct matched phrases in first-seen order.
    pub fn phrases(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::new();
        for m in &self.matches {
            if !seen.contains(&m.phrase.as_str()) {
                seen.push(&m.phrase);
            }
        }
        seen
    }
}

/// Case-insensitive substring matcher. Case folding is ASCII-only so reported
/// positions are byte offsets into the original text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Denylist {
    phrases: Vec<String>,
}

impl Default for Denylist {
    fn default() -> Self {
        Self::new(DEFAULT_BANNED_PHRASES.iter().copied())
    }
}

impl Denylist {
    pub fn new<I, S>(phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut normalized: Vec<String> = Vec::new();
        for phrase in phrases {
            let phrase = phrase.as_ref().trim().to_ascii_lowercase();
            if !phrase.is_empty() && !normalized.contains(&phrase) {
                normalized.push(phrase);
            }
        }
        Self { phrases: normalized }
    }

    pub fn phrases(&self) -> &[String] {
        &self.phrases
    }

    pub fn scan(&self, field: &str, text: &str) -> Vec<DenylistMatch> {
        let haystack = text.to_ascii_lowercase();
        let mut matches = Vec::new();

        for phrase in &self.phrases {
            for (position, _) in haystack.match_indices(phrase.as_str()) {
                matches.push(DenylistMatch {
                    phrase: phrase.clone(),
                    field: field.to_string(),
                    position,
                });
            }
        }

        matches.sort_by_key(|m| m.position);
        matches
    }

    pub fn check_text(&self, field: &str, text: &str) -> DenylistReport {
        DenylistReport {
            matches: self.scan(field, text),
        }
    }

    /// Scans the headline, each macro driver and the narrative.
    pub fn check_record(&self, record: &MarketContextRecord) -> DenylistReport {
        let mut matches = self.scan("headline", &record.headline);
        for (idx, driver) in record.macro_drivers.iter().enumerate() {
            matches.extend(self.scan(&format!("macro_drivers[{}]", idx), driver));
        }
        matches.extend(self.scan("narrative", &record.narrative));
        DenylistReport { matches }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_scenario_we_expect_is_flagged() {
        let denylist = Denylist::default();
        let report = denylist.check_text(
            "narrative",
            "Equities rallied and we expect further gains.",
        );
        assert!(!report.passed());
        assert_eq!(report.phrases(), vec!["we expect"]);
        assert_eq!(report.matches[0].position, 21);
    }

    #[test]
    fn test_matching_is_case_insensitive() {
        let denylist = Denylist::new(["Going Forward"]);
        let report = denylist.check_text("narrative", "GOING FORWARD, rates stayed high.");
        assert_eq!(report.matches.len(), 1);
        assert_eq!(report.matches[0].phrase, "going forward");
        assert_eq!(report.matches[0].position, 0);
    }

    #[test]
    fn test_clean_text_passes() {
        let denylist = Denylist::default();
        let report = denylist.check_text(
            "narrative",
            "The index returned 11.8 percent as inflation cooled during the quarter.",
        );
        assert!(report.passed());
    }

    #[test]
    fn test_every_occurrence_is_reported() {
        let denylist = Denylist::new(["will likely"]);
        let report = denylist.check_text("narrative", "Rates will likely fall; growth will likely slow.");
        let positions: Vec<usize> = report.matches.iter().map(|m| m.position).collect();
        assert_eq!(positions, vec![6, 31]);
        assert_eq!(report.phrases(), vec!["will likely"]);
    }

    #[test]
    fn test_record_fields_are_scanned() {
        let record = MarketContextRecord {
            period: "2025-Q2".to_string(),
            headline: "Stocks are poised to climb".to_string(),
            macro_drivers: vec!["Easing inflation".to_string(), "Investors should rotate".to_string()],
            key_stats: BTreeMap::new(),
            narrative: "A calm quarter.".to_string(),
            sources: vec!["doc".to_string()],
        };

        let report = Denylist::default().check_record(&record);
        let fields: Vec<&str> = report.matches.iter().map(|m| m.field.as_str()).collect();
        assert_eq!(fields, vec!["headline", "macro_drivers[1]"]);
    }

    #[test]
    fn test_blank_phrases_are_ignored() {
        let denylist = Denylist::new(["", "  ", "we expect", "WE EXPECT"]);
        assert_eq!(denylist.phrases(), &["we expect".to_string()]);
    }
}
