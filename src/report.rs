//! Markdown rendering of a validated record.
//!
//! Rendering is purely mechanical: no text is generated, so the published
//! report carries exactly the numbers and phrasing that passed validation.

use crate::schema::MarketContextRecord;
use crate::utils::Period;
use std::fmt::Write;

pub const DATA_NOT_AVAILABLE: &str = "data not available";

/// Renders `record` for `period`. Statistics named in `unavailable` are listed
/// as "data not available" rather than silently dropped.
pub fn render_report(record: &MarketContextRecord, period: &Period, unavailable: &[&str]) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "# Market Context: {}", record.period);
    let _ = writeln!(out);
    let _ = writeln!(out, "_{}_", period.month_span());
    let _ = writeln!(out);
    let _ = writeln!(out, "**{}**", record.headline.trim());
    let _ = writeln!(out);

    let _ = writeln!(out, "## Macro Drivers");
    let _ = writeln!(out);
    for driver in &record.macro_drivers {
        let _ = writeln!(out, "- {}", driver.trim());
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "## Narrative");
    let _ = writeln!(out);
    let _ = writeln!(out, "{}", record.narrative.trim());
    let _ = writeln!(out);

    if !record.key_stats.is_empty() || !unavailable.is_empty() {
        let _ = writeln!(out, "## Key Statistics");
        let _ = writeln!(out);
        let _ = writeln!(out, "| Statistic | Value |");
        let _ = writeln!(out, "|---|---:|");
        for (name, value) in &record.key_stats {
            let _ = writeln!(out, "| {} | {} |", name, value);
        }
        for name in unavailable {
            if !record.key_stats.contains_key(*name) {
                let _ = writeln!(out, "| {} | {} |", name, DATA_NOT_AVAILABLE);
            }
        }
        let _ = writeln!(out);
    }

    let _ = writeln!(out, "## Sources");
    let _ = writeln!(out);
    for source in &record.sources {
        let _ = writeln!(out, "- {}", source.trim());
    }

    out
}
