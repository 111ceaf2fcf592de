//! # Market Context Builder
//!
//! Drafts a "Market Context" narrative for a reporting period with a language
//! model, then refuses to publish anything it cannot verify.
//!
//! ## Core Concepts
//!
//! - **Snapshot**: the numeric market statistics for a period. Statistics the
//!   source cannot supply are marked unavailable, never estimated
//! - **Record**: the structured output (`headline`, `macro_drivers`,
//!   `key_stats`, `narrative`, `sources`) checked against [`SchemaLimits`]
//! - **Numeric fidelity**: every number in the narrative must match a
//!   `key_stats` value within a relative tolerance, and every `key_stats`
//!   value must match the snapshot
//! - **Denylist**: forward-looking or advisory phrases fail validation
//! - **Revision budget**: a failing draft is sent back for revision a bounded
//!   number of times; exhausting it is a failure, never a silent fix
//!
//! ## Example
//!
//! ```rust,ignore
//! use market_context_builder::*;
//! use std::sync::Arc;
//!
//! let index = KeywordIndex::load_dir("data/documents").await?;
//! let generator = GuardedGenerator::new(
//!     Arc::new(OpenAiClient::new(api_key)),
//!     Arc::new(RateLimiter::new(RateLimits::default())),
//!     CallPolicy::default(),
//! );
//! let pipeline = MarketContextPipeline::new(
//!     Arc::new(index),
//!     Arc::new(FixedMarketData::reference()),
//!     Arc::new(generator),
//! );
//!
//! let output = pipeline.run(&Period::parse("2025-Q2")?).await?;
//! println!("{}", output.report);
//! ```

pub mod config;
pub mod denylist;
pub mod error;
pub mod llm;
pub mod numeric;
pub mod parse;
pub mod pipeline;
pub mod report;
pub mod retrieval;
pub mod schema;
pub mod snapshot;
pub mod utils;
pub mod validator;

#[cfg(feature = "server")]
pub mod server;

pub use config::AppConfig;
pub use denylist::{Denylist, DenylistMatch, DenylistReport, DEFAULT_BANNED_PHRASES};
pub use error::{FailureKind, MarketContextError, Result};
pub use llm::{CallPolicy, GenerationRequest, GuardedGenerator, RateLimiter, RateLimits, TextGenerator};
#[cfg(feature = "openai")]
pub use llm::OpenAiClient;
pub use numeric::{extract_numbers, NumericFidelityChecker, NumericReport, NumericToken};
pub use parse::{parse_generated, ParseFailure, ParsedOutput};
pub use pipeline::{
    MarketContextPipeline, PipelineEvent, PipelineFailure, PipelineOutput, PipelineSettings,
    PipelineStage, PipelineState,
};
pub use report::{render_report, DATA_NOT_AVAILABLE};
pub use retrieval::{extract_key_themes, KeywordIndex, RetrievedChunk, Retriever};
pub use schema::*;
pub use snapshot::{FileSnapshotStore, FixedMarketData, Snapshot, SnapshotSource, StatValue};
pub use utils::*;
pub use validator::{KeyStatIssue, ValidationFailure, ValidationReport, Validator};

use log::debug;

/// Validates raw model text for `period` against `snapshot` with the default
/// rules. Useful for checking a stored draft outside the pipeline.
pub fn check_generated_text(text: &str, period: &str, snapshot: &Snapshot) -> Result<ValidationReport> {
    let period = Period::parse(period)?;
    if snapshot.period != period.label() {
        return Err(MarketContextError::Snapshot {
            period: period.label(),
            details: format!("snapshot is for {}", snapshot.period),
        });
    }

    let report = Validator::default().validate(&parse_generated(text), &period, snapshot);
    debug!(
        "Checked text for {}: valid={} failures={:?}",
        period,
        report.is_valid(),
        report.kinds()
    );
    Ok(report)
}
