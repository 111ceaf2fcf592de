//! The draft, validate and revise state machine.
//!
//! ```text
//! Retrieving -> Drafting -> Validating -> (Revising -> Validating)* -> Done | Failed
//! ```
//!
//! Each run owns its [`PipelineState`]. Collaborators are shared, so one
//! pipeline can serve concurrent requests.

use crate::error::FailureKind;
use crate::llm::prompts;
use crate::llm::{GenerationRequest, TextGenerator};
use crate::parse::{parse_generated, ParseFailure, ParsedOutput};
use crate::report::render_report;
use crate::retrieval::{extract_key_themes, RetrievedChunk, Retriever};
use crate::schema::MarketContextRecord;
use crate::snapshot::{Snapshot, SnapshotSource};
use crate::utils::{excerpt, Period};
use crate::validator::{ValidationReport, Validator};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::Sender;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Retrieving,
    Drafting,
    Validating,
    Revising,
    Done,
    Failed,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStage::Retrieving => "retrieving",
            PipelineStage::Drafting => "drafting",
            PipelineStage::Validating => "validating",
            PipelineStage::Revising => "revising",
            PipelineStage::Done => "done",
            PipelineStage::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    Starting { period: String },
    StageChanged { stage: PipelineStage },
    RetrievalDegraded { reason: String },
    Retrieved { chunks: usize, themes: Vec<String> },
    SnapshotLoaded { available: usize, missing: usize },
    Validating { attempt: u32 },
    CorrectionNeeded { revision: u32, reasons: Vec<String> },
    Success { revisions: u32 },
    Failed { kind: FailureKind, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Maximum number of revision calls after the first draft.
    pub revision_budget: u32,
    pub top_k: usize,
    pub temperature: f32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            revision_budget: 1,
            top_k: 2,
            temperature: 0.0,
        }
    }
}

/// Per-request working state. Never shared between runs.
#[derive(Debug, Clone)]
pub struct PipelineState {
    pub period: Period,
    pub stage: PipelineStage,
    pub chunks: Vec<RetrievedChunk>,
    pub retrieval_degraded: bool,
    pub themes: Vec<String>,
    pub snapshot: Option<Snapshot>,
    pub raw_output: Option<String>,
    pub parsed: Option<ParsedOutput>,
    /// Latest attempt's candidate, `None` when that attempt did not parse.
    pub draft: Option<Value>,
    /// Latest attempt's parse error, `None` when that attempt parsed.
    pub last_parse_error: Option<ParseFailure>,
    pub validation: Option<ValidationReport>,
    pub revisions: u32,
}

impl PipelineState {
    pub fn new(period: Period) -> Self {
        Self {
            period,
            stage: PipelineStage::Retrieving,
            chunks: Vec::new(),
            retrieval_degraded: false,
            themes: Vec::new(),
            snapshot: None,
            raw_output: None,
            parsed: None,
            draft: None,
            last_parse_error: None,
            validation: None,
            revisions: 0,
        }
    }

    fn accept_output(&mut self, text: String) {
        let parsed = parse_generated(&text);
        match &parsed {
            ParsedOutput::Structured(value) => {
                self.draft = Some(value.clone());
                self.last_parse_error = None;
            }
            ParsedOutput::Failure(failure) => {
                warn!("Model output for {} did not parse: {}", self.period, failure.reason);
                self.draft = None;
                self.last_parse_error = Some(failure.clone());
            }
        }
        self.raw_output = Some(text);
        self.parsed = Some(parsed);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineOutput {
    pub record: MarketContextRecord,
    /// Markdown rendering of `record`.
    pub report: String,
    pub revisions: u32,
    pub retrieval_degraded: bool,
    pub chunks: Vec<RetrievedChunk>,
    pub snapshot: Snapshot,
}

impl PipelineOutput {
    /// Non-fatal problems the run recovered from.
    pub fn warnings(&self) -> Vec<FailureKind> {
        let mut warnings = Vec::new();
        if self.retrieval_degraded {
            warnings.push(FailureKind::RetrievalDegraded);
        }
        warnings
    }
}

/// Why a run ended in `Failed`. Only revision-budget exhaustion and external
/// failures reach callers.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {reason}")]
pub struct PipelineFailure {
    pub kind: FailureKind,
    pub reason: String,
    /// Failure kinds of the last validation, when one ran.
    pub validation_kinds: Vec<FailureKind>,
    pub violations: Vec<String>,
    pub last_draft: Option<Value>,
    pub last_parse_error: Option<ParseFailure>,
    /// Raw text of the latest model reply, parsed or not.
    pub last_output: Option<String>,
    pub revisions: u32,
}

impl PipelineFailure {
    fn external(state: &PipelineState, reason: String) -> Self {
        Self {
            kind: FailureKind::ExternalFailure,
            reason,
            validation_kinds: Vec::new(),
            violations: Vec::new(),
            last_draft: state.draft.clone(),
            last_parse_error: state.last_parse_error.clone(),
            last_output: state.raw_output.clone(),
            revisions: state.revisions,
        }
    }

    fn budget_exhausted(state: &PipelineState, report: &ValidationReport, budget: u32) -> Self {
        let violations = report.reasons();
        Self {
            kind: FailureKind::RevisionBudgetExhausted,
            reason: format!(
                "validation still failing after {} of {} revisions: {}",
                state.revisions,
                budget,
                violations.join("; ")
            ),
            validation_kinds: report.kinds(),
            violations,
            last_draft: state.draft.clone(),
            last_parse_error: state.last_parse_error.clone(),
            last_output: state.raw_output.clone(),
            revisions: state.revisions,
        }
    }
}

pub struct MarketContextPipeline {
    retriever: Arc<dyn Retriever>,
    snapshots: Arc<dyn SnapshotSource>,
    generator: Arc<dyn TextGenerator>,
    validator: Validator,
    settings: PipelineSettings,
}

impl MarketContextPipeline {
    pub fn new(
        retriever: Arc<dyn Retriever>,
        snapshots: Arc<dyn SnapshotSource>,
        generator: Arc<dyn TextGenerator>,
    ) -> Self {
        Self {
            retriever,
            snapshots,
            generator,
            validator: Validator::default(),
            settings: PipelineSettings::default(),
        }
    }

    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn retriever(&self) -> &Arc<dyn Retriever> {
        &self.retriever
    }

    pub async fn run(&self, period: &Period) -> Result<PipelineOutput, PipelineFailure> {
        self.run_with_progress(period, None).await
    }

    pub async fn run_with_progress(
        &self,
        period: &Period,
        progress: Option<Sender<PipelineEvent>>,
    ) -> Result<PipelineOutput, PipelineFailure> {
        info!("Building market context for {}", period);
        self.send_event(&progress, PipelineEvent::Starting { period: period.label() })
            .await;

        let mut state = PipelineState::new(*period);
        loop {
            self.send_event(&progress, PipelineEvent::StageChanged { stage: state.stage })
                .await;

            let next = match self.step(&mut state, &progress).await {
                Ok(next) => next,
                Err(failure) => {
                    state.stage = PipelineStage::Failed;
                    warn!("Market context for {} failed: {}", period, failure);
                    self.send_event(
                        &progress,
                        PipelineEvent::Failed {
                            kind: failure.kind,
                            reason: failure.reason.clone(),
                        },
                    )
                    .await;
                    return Err(failure);
                }
            };

            debug!("{}: {} -> {}", period, state.stage, next);
            state.stage = next;
            if next == PipelineStage::Done {
                break;
            }
        }

        let output = self.finish(state)?;
        info!(
            "Market context for {} validated after {} revision(s)",
            period, output.revisions
        );
        self.send_event(&progress, PipelineEvent::Success { revisions: output.revisions })
            .await;
        Ok(output)
    }

    /// Performs the work of the current stage and returns the next one.
    async fn step(
        &self,
        state: &mut PipelineState,
        progress: &Option<Sender<PipelineEvent>>,
    ) -> Result<PipelineStage, PipelineFailure> {
        match state.stage {
            PipelineStage::Retrieving => {
                self.gather(state, progress).await?;
                Ok(PipelineStage::Drafting)
            }
            PipelineStage::Drafting => {
                let snapshot = self.snapshot_of(state)?;
                let user_prompt = prompts::draft_prompt(&state.period, &state.chunks, snapshot, &state.themes)
                    .map_err(|e| PipelineFailure::external(state, format!("could not build prompt: {}", e)))?;
                let text = self.call_model(state, user_prompt).await?;
                state.accept_output(text);
                Ok(PipelineStage::Validating)
            }
            PipelineStage::Validating => {
                let attempt = state.revisions + 1;
                self.send_event(progress, PipelineEvent::Validating { attempt }).await;

                let report = {
                    let snapshot = self.snapshot_of(state)?;
                    let parsed = state.parsed.as_ref().ok_or_else(|| {
                        PipelineFailure::external(state, "no model output to validate".to_string())
                    })?;
                    self.validator.validate(parsed, &state.period, snapshot)
                };

                if report.is_valid() {
                    state.validation = Some(report);
                    return Ok(PipelineStage::Done);
                }

                let reasons = report.reasons();
                info!(
                    "Attempt {} for {} failed validation: {:?}",
                    attempt,
                    state.period,
                    report.kinds()
                );

                if state.revisions >= self.settings.revision_budget {
                    let failure = PipelineFailure::budget_exhausted(state, &report, self.settings.revision_budget);
                    state.validation = Some(report);
                    return Err(failure);
                }

                self.send_event(
                    progress,
                    PipelineEvent::CorrectionNeeded {
                        revision: state.revisions + 1,
                        reasons,
                    },
                )
                .await;
                state.validation = Some(report);
                Ok(PipelineStage::Revising)
            }
            PipelineStage::Revising => {
                let snapshot = self.snapshot_of(state)?;
                let reasons = state
                    .validation
                    .as_ref()
                    .map(|r| r.reasons())
                    .unwrap_or_default();
                let previous = state.raw_output.clone().unwrap_or_default();
                let user_prompt = prompts::revision_prompt(&state.period, &previous, &reasons, snapshot)
                    .map_err(|e| PipelineFailure::external(state, format!("could not build prompt: {}", e)))?;

                let text = self.call_model(state, user_prompt).await?;
                state.revisions += 1;
                state.accept_output(text);
                Ok(PipelineStage::Validating)
            }
            PipelineStage::Done | PipelineStage::Failed => Ok(state.stage),
        }
    }

    /// Loads the retrieved chunks and the snapshot concurrently.
    async fn gather(
        &self,
        state: &mut PipelineState,
        progress: &Option<Sender<PipelineEvent>>,
    ) -> Result<(), PipelineFailure> {
        let period = state.period;
        let (retrieved, snapshot) = futures::join!(
            self.retriever.retrieve(&period, self.settings.top_k),
            self.snapshots.get_snapshot(&period)
        );

        match retrieved {
            Ok(chunks) => state.chunks = chunks,
            Err(e) => {
                warn!("Retrieval degraded for {}: {}", period, e);
                state.retrieval_degraded = true;
                state.chunks.clear();
                self.send_event(progress, PipelineEvent::RetrievalDegraded { reason: e.to_string() })
                    .await;
            }
        }
        state.themes = extract_key_themes(&state.chunks.iter().map(|c| c.text.as_str()).collect::<Vec<_>>());
        self.send_event(
            progress,
            PipelineEvent::Retrieved {
                chunks: state.chunks.len(),
                themes: state.themes.clone(),
            },
        )
        .await;

        let snapshot = snapshot
            .map_err(|e| PipelineFailure::external(state, format!("snapshot unavailable: {}", e)))?;
        if !snapshot.missing().is_empty() {
            info!("Snapshot for {} lacks: {}", period, snapshot.missing().join(", "));
        }
        self.send_event(
            progress,
            PipelineEvent::SnapshotLoaded {
                available: snapshot.available().len(),
                missing: snapshot.missing().len(),
            },
        )
        .await;
        state.snapshot = Some(snapshot);
        Ok(())
    }

    async fn call_model(&self, state: &PipelineState, user_prompt: String) -> Result<String, PipelineFailure> {
        let system_prompt = prompts::system_prompt()
            .map_err(|e| PipelineFailure::external(state, format!("could not build prompt: {}", e)))?;
        let request = GenerationRequest::new(system_prompt, user_prompt).with_temperature(self.settings.temperature);

        let text = self
            .generator
            .generate(&request)
            .await
            .map_err(|e| PipelineFailure::external(state, format!("model call failed: {}", e)))?;
        debug!("Model replied for {}: {}", state.period, excerpt(&text, 200));
        Ok(text)
    }

    fn snapshot_of<'a>(&self, state: &'a PipelineState) -> Result<&'a Snapshot, PipelineFailure> {
        state
            .snapshot
            .as_ref()
            .ok_or_else(|| PipelineFailure::external(state, "snapshot was not loaded".to_string()))
    }

    fn finish(&self, state: PipelineState) -> Result<PipelineOutput, PipelineFailure> {
        let record = state
            .validation
            .as_ref()
            .and_then(|r| r.record.clone())
            .ok_or_else(|| PipelineFailure::external(&state, "no validated record".to_string()))?;
        let snapshot = self.snapshot_of(&state)?.clone();
        let report = render_report(&record, &state.period, &snapshot.missing());

        Ok(PipelineOutput {
            report,
            record,
            revisions: state.revisions,
            retrieval_degraded: state.retrieval_degraded,
            chunks: state.chunks,
            snapshot,
        })
    }

    async fn send_event(&self, sender: &Option<Sender<PipelineEvent>>, event: PipelineEvent) {
        if let Some(tx) = sender {
            let _ = tx.send(event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{MarketContextError, Result};
    use crate::snapshot::FixedMarketData;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct Replies(Mutex<VecDeque<Result<String>>>);

    #[async_trait]
    impl TextGenerator for Replies {
        async fn generate(&self, _request: &GenerationRequest) -> Result<String> {
            self.0
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(MarketContextError::Transport("no reply scripted".into())))
        }
    }

    struct NoDocs;

    #[async_trait]
    impl Retriever for NoDocs {
        async fn retrieve(&self, _period: &Period, _top_k: usize) -> Result<Vec<RetrievedChunk>> {
            Ok(Vec::new())
        }
    }

    fn pipeline(replies: Vec<Result<String>>) -> MarketContextPipeline {
        MarketContextPipeline::new(
            Arc::new(NoDocs),
            Arc::new(FixedMarketData::reference()),
            Arc::new(Replies(Mutex::new(replies.into()))),
        )
    }

    fn valid_reply() -> String {
        serde_json::json!({
            "period": "2025-Q2",
            "headline": "Equities advanced while the dollar weakened",
            "macro_drivers": ["Easing inflation", "Softer dollar"],
            "key_stats": { "sp500_tr": 12.3, "dxy_chg": -2.1 },
            "narrative": "The index delivered a total return of 12.3 percent while the dollar index fell 2.1 percent over the quarter.",
            "sources": ["market data snapshot"]
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_valid_first_draft_reaches_done() {
        let period = Period::parse("2025-Q2").unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::channel(64);

        let output = pipeline(vec![Ok(valid_reply())])
            .run_with_progress(&period, Some(tx))
            .await
            .unwrap();
        assert_eq!(output.revisions, 0);
        assert!(output.report.contains("# Market Context: 2025-Q2"));

        let mut stages = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let PipelineEvent::StageChanged { stage } = event {
                stages.push(stage);
            }
        }
        assert_eq!(
            stages,
            vec![PipelineStage::Retrieving, PipelineStage::Drafting, PipelineStage::Validating]
        );
    }

    #[tokio::test]
    async fn test_zero_budget_fails_without_revision() {
        let period = Period::parse("2025-Q2").unwrap();
        let failure = pipeline(vec![Ok("not json".to_string()), Ok(valid_reply())])
            .with_settings(PipelineSettings {
                revision_budget: 0,
                ..PipelineSettings::default()
            })
            .run(&period)
            .await
            .unwrap_err();

        assert_eq!(failure.kind, FailureKind::RevisionBudgetExhausted);
        assert_eq!(failure.revisions, 0);
        assert_eq!(failure.validation_kinds, vec![FailureKind::ParseFailure]);
    }

    #[test]
    fn test_state_records_parse_outcomes() {
        let mut state = PipelineState::new(Period::parse("2025-Q2").unwrap());
        state.accept_output("garbage".to_string());
        assert!(state.last_parse_error.is_some());
        assert!(state.draft.is_none());

        state.accept_output("{\"a\": 1}".to_string());
        assert_eq!(state.draft, Some(serde_json::json!({"a": 1})));
        assert!(state.last_parse_error.is_none());

        state.accept_output("still garbage".to_string());
        assert!(state.draft.is_none());
        assert_eq!(state.raw_output.as_deref(), Some("still garbage"));
        assert_eq!(state.last_parse_error.unwrap().excerpt, "still garbage");
    }
}
