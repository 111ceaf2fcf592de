// Prompts for the draft and revision calls

use crate::error::Result;
use crate::retrieval::RetrievedChunk;
use crate::schema::MarketContextRecord;
use crate::snapshot::Snapshot;
use crate::utils::Period;

pub const SYSTEM_PROMPT: &str = r#"
You are a Market Context Writer for quarterly investment reports.

## YOUR MISSION
Write a short, factual description of what happened in financial markets during ONE reporting period, using ONLY:
1. The retrieved research excerpts supplied in the request
2. The key statistics snapshot supplied in the request

## CRITICAL RULES - READ CAREFULLY

### Numbers
- Every number you write in the narrative MUST be one of the values in key_stats, written exactly as given.
- key_stats MUST be copied from the snapshot. Never round, rescale, or derive new values.
- Statistics listed as unavailable MUST NOT appear in key_stats. Never estimate them.
  If the narrative refers to one, write "data not available" in place of a value.
- Do not write percentages, dates or counts that are not in key_stats.

### Tone
- Describe the PAST only. No forecasts, outlooks or expectations.
- No advice. Never tell the reader what to buy, sell or do.
- Neutral, plain English suitable for a client report.

## OUTPUT FORMAT
Return ONE JSON object and nothing else. No markdown fences, no commentary.
The object must match this JSON Schema:
"#;

pub const STYLE_GUIDE: &str = r#"
## STYLE GUIDE
- headline: one sentence, at most 20 words.
- macro_drivers: 2 to 5 short phrases, most important first, each at most 20 words.
- narrative: one or two paragraphs, 10 to 250 words.
- sources: the source identifiers of the excerpts you relied on, or "market data snapshot".
- period: exactly the requested period label.
- Avoid phrases such as "we expect", "will likely", "going forward", "investors should".
"#;

pub const FEW_SHOT_EXAMPLE: &str = r#"
## EXAMPLE
Snapshot: {"sp500_tr": 11.8, "vix_peak": 31.2, "ust10y_yield": 4.25}

Output:
{
  "period": "2025-Q2",
  "headline": "Equities recovered from an early volatility spike as inflation pressures eased",
  "macro_drivers": [
    "Cooling inflation prints",
    "Resilient corporate earnings",
    "Tariff headlines driving early-quarter volatility"
  ],
  "key_stats": {"sp500_tr": 11.8, "vix_peak": 31.2, "ust10y_yield": 4.25},
  "narrative": "US equities delivered a total return of 11.8 percent over the quarter. Volatility spiked early, with the VIX peaking at 31.2 on tariff headlines, before easing as inflation data cooled. The ten-year Treasury yield finished the period at 4.25 percent.",
  "sources": ["q2_market_review.txt"]
}
"#;

/// Heading for the statistics the snapshot could not supply.
pub const DATA_NOT_AVAILABLE_LABEL: &str = "Data not available (leave out of key_stats, never estimate)";

pub fn system_prompt() -> Result<String> {
    let schema = MarketContextRecord::schema_as_json()?;
    Ok(format!(
        "{}\n```json\n{}\n```\n{}\n{}",
        SYSTEM_PROMPT.trim_end(),
        schema,
        STYLE_GUIDE,
        FEW_SHOT_EXAMPLE
    ))
}

pub fn draft_prompt(
    period: &Period,
    chunks: &[RetrievedChunk],
    snapshot: &Snapshot,
    themes: &[String],
) -> Result<String> {
    let themes = if themes.is_empty() {
        "none detected".to_string()
    } else {
        themes.join(", ")
    };

    Ok(format!(
        r#"Write the market context for period {period} ({months}).

## RETRIEVED CONTEXT
{context}

## KEY THEMES
{themes}

## KEY STATISTICS SNAPSHOT
{stats}

Return the JSON object now."#,
        period = period,
        months = period.month_span(),
        context = format_context(chunks),
        themes = themes,
        stats = format_stats(snapshot)?,
    ))
}

pub fn revision_prompt(
    period: &Period,
    previous_output: &str,
    reasons: &[String],
    snapshot: &Snapshot,
) -> Result<String> {
    let problems = reasons
        .iter()
        .map(|r| format!("- {}", r))
        .collect::<Vec<_>>()
        .join("\n");

    Ok(format!(
        r#"Your previous market context for period {period} was rejected.

## PROBLEMS FOUND
{problems}

## YOUR PREVIOUS OUTPUT
{previous}

## KEY STATISTICS SNAPSHOT
{stats}

Fix EVERY problem listed above. Remove any number that is not a snapshot value
rather than inventing one. Keep everything that was already correct.
Return the complete corrected JSON object and nothing else."#,
        period = period,
        problems = problems,
        previous = previous_output.trim(),
        stats = format_stats(snapshot)?,
    ))
}

fn format_context(chunks: &[RetrievedChunk]) -> String {
    if chunks.is_empty() {
        return "No documents were retrieved. Rely on the statistics snapshot only.".to_string();
    }
    chunks
        .iter()
        .map(|c| format!("[{} p.{}]\n{}", c.source_id, c.page_number, c.text))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn format_stats(snapshot: &Snapshot) -> Result<String> {
    let available = serde_json::to_string_pretty(&snapshot.available())?;
    let missing = snapshot.missing();
    if missing.is_empty() {
        Ok(available)
    } else {
        Ok(format!(
            "{}\n{}: {}",
            available,
            DATA_NOT_AVAILABLE_LABEL,
            missing.join(", ")
        ))
    }
}
