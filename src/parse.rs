//! Extraction of a JSON object from untrusted model text.

use crate::utils::excerpt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

const EXCERPT_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParseFailure {
    pub reason: String,
    /// The start of the offending text, for logs and revision prompts.
    pub excerpt: String,
}

impl fmt::Display for ParseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (output began: {:?})", self.reason, self.excerpt)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedOutput {
    Structured(Value),
    Failure(ParseFailure),
}

impl ParsedOutput {
    pub fn into_result(self) -> Result<Value, ParseFailure> {
        match self {
            ParsedOutput::Structured(value) => Ok(value),
            ParsedOutput::Failure(failure) => Err(failure),
        }
    }
}

/// Finds the JSON object in a model response.
///
/// Tried in order: the whole trimmed text, a ```json fenced block, any fenced
/// block, then the first balanced `{...}` span. The value must be an object.
pub fn parse_generated(text: &str) -> ParsedOutput {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return failure("model returned an empty response", text);
    }

    let mut candidates: Vec<&str> = vec![trimmed];
    if let Some(block) = fenced_block(trimmed, Some("json")) {
        candidates.push(block);
    }
    if let Some(block) = fenced_block(trimmed, None) {
        candidates.push(block);
    }
    if let Some(span) = first_balanced_object(trimmed) {
        candidates.push(span);
    }

    let mut saw_non_object = false;
    let mut last_error = None;
    for candidate in candidates {
        match serde_json::from_str::<Value>(candidate) {
            Ok(value @ Value::Object(_)) => return ParsedOutput::Structured(value),
            Ok(_) => saw_non_object = true,
            Err(e) => last_error = Some(e.to_string()),
        }
    }

    if saw_non_object {
        return failure("response is valid JSON but not an object", text);
    }
    match last_error {
        Some(e) => failure(&format!("no JSON object found: {}", e), text),
        None => failure("no JSON object found", text),
    }
}

fn failure(reason: &str, text: &str) -> ParsedOutput {
    ParsedOutput::Failure(ParseFailure {
        reason: reason.to_string(),
        excerpt: excerpt(text.trim(), EXCERPT_CHARS),
    })
}

/// Body of the first ``` fence, optionally requiring an info string.
fn fenced_block<'a>(text: &'a str, lang: Option<&str>) -> Option<&'a str> {
    let mut rest = text;
    while let Some(open) = rest.find("```") {
        let after_ticks = &rest[open + 3..];
        let line_end = after_ticks.find('\n')?;
        let info = after_ticks[..line_end].trim();
        let body = &after_ticks[line_end + 1..];
        let close = body.find("```")?;

        let wanted = match lang {
            Some(lang) => info.eq_ignore_ascii_case(lang),
            None => true,
        };
        if wanted {
            return Some(body[..close].trim());
        }
        rest = &body[close + 3..];
    }
    None
}

/// The first `{...}` span whose braces balance, ignoring braces inside strings.
fn first_balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}
