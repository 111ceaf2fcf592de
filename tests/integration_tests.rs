use async_trait::async_trait;
use market_context_builder::*;
use serde_json::{json, Value};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Replays a fixed list of replies and records every request it receives.
struct ScriptedGenerator {
    replies: Mutex<VecDeque<Result<String>>>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    fn new(replies: Vec<Result<String>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn always(reply: &str, times: usize) -> Arc<Self> {
        Self::new((0..times).map(|_| Ok(reply.to_string())).collect())
    }

    fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn request(&self, idx: usize) -> GenerationRequest {
        self.requests.lock().unwrap()[idx].clone()
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        self.requests.lock().unwrap().push(request.clone());
        let reply = self.replies.lock().unwrap().pop_front();
        reply.unwrap_or_else(|| Err(MarketContextError::Transport("script exhausted".into())))
    }
}

/// Hangs on the first call, then answers.
struct SlowThenReady {
    calls: Mutex<u32>,
    reply: String,
}

#[async_trait]
impl TextGenerator for SlowThenReady {
    async fn generate(&self, _request: &GenerationRequest) -> Result<String> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            *calls
        };
        if call == 1 {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(self.reply.clone())
    }
}

struct StaticRetriever(Vec<RetrievedChunk>);

#[async_trait]
impl Retriever for StaticRetriever {
    async fn retrieve(&self, _period: &Period, top_k: usize) -> Result<Vec<RetrievedChunk>> {
        Ok(self.0.iter().take(top_k).cloned().collect())
    }
}

struct BrokenRetriever;

#[async_trait]
impl Retriever for BrokenRetriever {
    async fn retrieve(&self, _period: &Period, _top_k: usize) -> Result<Vec<RetrievedChunk>> {
        Err(MarketContextError::Retrieval("index offline".into()))
    }
}

struct BrokenSnapshots;

#[async_trait]
impl SnapshotSource for BrokenSnapshots {
    async fn get_snapshot(&self, period: &Period) -> Result<Snapshot> {
        Err(MarketContextError::Snapshot {
            period: period.label(),
            details: "feed unreachable".into(),
        })
    }
}

fn period() -> Period {
    Period::parse("2025-Q2").unwrap()
}

fn scenario_snapshot() -> FixedMarketData {
    FixedMarketData::empty()
        .with_stat("sp500_tr", StatValue::Value(11.8))
        .with_stat("vix_peak", StatValue::Value(31.2))
        .with_stat("dxy_chg", StatValue::NotAvailable)
}

fn record_json(narrative: &str) -> Value {
    json!({
        "period": "2025-Q2",
        "headline": "Equities climbed as volatility spiked then faded",
        "macro_drivers": ["Cooling inflation", "Tariff headlines"],
        "key_stats": { "sp500_tr": 11.8, "vix_peak": 31.2 },
        "narrative": narrative,
        "sources": ["q2_review.txt"]
    })
}

const GOOD_NARRATIVE: &str =
    "The index returned 11.8 percent over the quarter while the VIX peaked at 31.2 in April.";
const INVENTED_NUMBER: &str =
    "The index returned 12.0 percent over the quarter while the VIX peaked at 31.2 in April.";
const FORWARD_LOOKING: &str =
    "The index returned 11.8 percent over the quarter and we expect the VIX to stay below 31.2.";

fn reply(narrative: &str) -> String {
    record_json(narrative).to_string()
}

fn pipeline_with(
    retriever: Arc<dyn Retriever>,
    generator: Arc<dyn TextGenerator>,
    budget: u32,
) -> MarketContextPipeline {
    MarketContextPipeline::new(retriever, Arc::new(scenario_snapshot()), generator).with_settings(
        PipelineSettings {
            revision_budget: budget,
            ..PipelineSettings::default()
        },
    )
}

fn no_docs() -> Arc<dyn Retriever> {
    Arc::new(KeywordIndex::new())
}

// Record-level checks

#[test]
fn test_valid_record_round_trips_unchanged() {
    let candidate = record_json(GOOD_NARRATIVE);
    let record = validate_record(&candidate, &SchemaLimits::default(), Some("2025-Q2")).unwrap();
    assert_eq!(serde_json::to_value(&record).unwrap(), candidate);
}

#[test]
fn test_missing_narrative_is_named() {
    let mut candidate = record_json(GOOD_NARRATIVE);
    candidate.as_object_mut().unwrap().remove("narrative");

    let violations = validate_record(&candidate, &SchemaLimits::default(), None).unwrap_err();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].field, "narrative");
    assert_eq!(violations[0].constraint, Constraint::Missing);
}

#[test]
fn test_numeric_scenarios() {
    let mut stats = BTreeMap::new();
    stats.insert("sp500_tr".to_string(), 11.8);
    stats.insert("vix_peak".to_string(), 31.2);
    let checker = NumericFidelityChecker::default();

    assert!(checker
        .check(GOOD_NARRATIVE, &stats, Some(&period()))
        .passed());

    let report = checker.check(INVENTED_NUMBER, &stats, Some(&period()));
    assert_eq!(report.unmatched_texts(), vec!["12.0"]);
}

#[test]
fn test_denylist_scenario() {
    let report = Denylist::default().check_text("narrative", FORWARD_LOOKING);
    assert_eq!(report.phrases(), vec!["we expect"]);
    assert!(Denylist::default()
        .check_text("narrative", GOOD_NARRATIVE)
        .passed());
}

// Pipeline runs

#[tokio::test]
async fn test_first_draft_valid_reaches_done() {
    let generator = ScriptedGenerator::new(vec![Ok(reply(GOOD_NARRATIVE))]);
    let output = pipeline_with(no_docs(), generator.clone(), 1)
        .run(&period())
        .await
        .unwrap();

    assert_eq!(output.revisions, 0);
    assert_eq!(output.record.narrative, GOOD_NARRATIVE);
    assert_eq!(generator.calls(), 1);
    assert_eq!(generator.request(0).temperature, 0.0);
    assert!(generator.request(0).user_prompt.contains("\"vix_peak\": 31.2"));
    assert!(generator.request(0).user_prompt.contains("data not available"));
    assert!(generator.request(0).user_prompt.contains("never estimate): dxy_chg"));
    assert!(generator.request(0).system_prompt.contains("\"data not available\""));
    assert!(output.report.contains("| dxy_chg | data not available |"));
    assert!(output.report.contains("_April to June 2025_"));
}

#[tokio::test]
async fn test_revision_fixes_invented_number() {
    let generator = ScriptedGenerator::new(vec![Ok(reply(INVENTED_NUMBER)), Ok(reply(GOOD_NARRATIVE))]);
    let (tx, mut rx) = tokio::sync::mpsc::channel(64);

    let output = pipeline_with(no_docs(), generator.clone(), 1)
        .run_with_progress(&period(), Some(tx))
        .await
        .unwrap();

    assert_eq!(output.revisions, 1);
    assert_eq!(generator.calls(), 2);
    let revision_prompt = generator.request(1).user_prompt;
    assert!(revision_prompt.contains("'12.0'"));
    assert!(revision_prompt.contains("was rejected"));

    let mut corrections = 0;
    while let Ok(event) = rx.try_recv() {
        if let PipelineEvent::CorrectionNeeded { revision, reasons } = event {
            corrections += 1;
            assert_eq!(revision, 1);
            assert!(reasons.iter().any(|r| r.contains("12.0")));
        }
    }
    assert_eq!(corrections, 1);
}

#[tokio::test]
async fn test_budget_is_never_exceeded() {
    for budget in 0..=3u32 {
        let generator = ScriptedGenerator::always(&reply(FORWARD_LOOKING), 10);
        let failure = pipeline_with(no_docs(), generator.clone(), budget)
            .run(&period())
            .await
            .unwrap_err();

        assert_eq!(failure.kind, FailureKind::RevisionBudgetExhausted);
        assert_eq!(failure.revisions, budget);
        assert_eq!(generator.calls(), budget as usize + 1);
        assert_eq!(failure.validation_kinds, vec![FailureKind::DenylistViolation]);
        assert!(failure.violations.iter().any(|v| v.contains("'we expect'")));
        assert_eq!(failure.last_draft, Some(record_json(FORWARD_LOOKING)));
    }
}

#[tokio::test]
async fn test_two_unparseable_outputs_fail_with_parse_error() {
    let generator = ScriptedGenerator::new(vec![
        Ok("Sorry, I cannot produce that.".to_string()),
        Ok("Here you go: {\"period\": ".to_string()),
    ]);
    let failure = pipeline_with(no_docs(), generator.clone(), 1)
        .run(&period())
        .await
        .unwrap_err();

    assert_eq!(failure.kind, FailureKind::RevisionBudgetExhausted);
    assert_eq!(failure.validation_kinds, vec![FailureKind::ParseFailure]);
    assert_eq!(failure.revisions, 1);
    assert!(failure.last_draft.is_none());
    let parse_error = failure.last_parse_error.unwrap();
    assert!(parse_error.excerpt.starts_with("Here you go"));
}

#[tokio::test]
async fn test_failure_reports_only_the_final_attempt_after_unparseable_revision() {
    let generator = ScriptedGenerator::new(vec![Ok(reply(INVENTED_NUMBER)), Ok("I refuse.".to_string())]);
    let failure = pipeline_with(no_docs(), generator, 1)
        .run(&period())
        .await
        .unwrap_err();

    assert_eq!(failure.kind, FailureKind::RevisionBudgetExhausted);
    assert_eq!(failure.validation_kinds, vec![FailureKind::ParseFailure]);
    assert!(failure.last_draft.is_none());
    assert_eq!(failure.last_parse_error.unwrap().excerpt, "I refuse.");
    assert_eq!(failure.last_output.as_deref(), Some("I refuse."));
}

#[tokio::test]
async fn test_failure_reports_only_the_final_attempt_after_parseable_revision() {
    let generator = ScriptedGenerator::new(vec![Ok("garbage".to_string()), Ok(reply(INVENTED_NUMBER))]);
    let failure = pipeline_with(no_docs(), generator, 1)
        .run(&period())
        .await
        .unwrap_err();

    assert_eq!(failure.kind, FailureKind::RevisionBudgetExhausted);
    assert_eq!(failure.validation_kinds, vec![FailureKind::NumericMismatch]);
    assert!(failure.last_parse_error.is_none());
    assert_eq!(failure.last_draft, Some(record_json(INVENTED_NUMBER)));
    assert_eq!(failure.last_output, Some(reply(INVENTED_NUMBER)));
    assert!(failure.violations.iter().any(|v| v.contains("'12.0'")));
}

#[tokio::test]
async fn test_empty_retrieval_still_completes() {
    let generator = ScriptedGenerator::new(vec![Ok(reply(GOOD_NARRATIVE))]);
    let output = pipeline_with(Arc::new(StaticRetriever(Vec::new())), generator.clone(), 1)
        .run(&period())
        .await
        .unwrap();

    assert!(output.chunks.is_empty());
    assert!(!output.retrieval_degraded);
    assert!(output.warnings().is_empty());
    assert!(generator.request(0).user_prompt.contains("No documents were retrieved"));
}

#[tokio::test]
async fn test_retrieval_error_degrades_instead_of_failing() {
    let generator = ScriptedGenerator::new(vec![Ok(reply(GOOD_NARRATIVE))]);
    let (tx, mut rx) = tokio::sync::mpsc::channel(64);

    let output = pipeline_with(Arc::new(BrokenRetriever), generator, 1)
        .run_with_progress(&period(), Some(tx))
        .await
        .unwrap();
    assert!(output.retrieval_degraded);
    assert_eq!(output.warnings(), vec![FailureKind::RetrievalDegraded]);

    let mut degraded = false;
    while let Ok(event) = rx.try_recv() {
        if let PipelineEvent::RetrievalDegraded { reason } = event {
            degraded = reason.contains("index offline");
        }
    }
    assert!(degraded);
}

#[tokio::test]
async fn test_retrieved_chunks_reach_the_prompt() {
    let chunks = vec![RetrievedChunk {
        text: "Tariff headlines lifted volatility early in the quarter.".to_string(),
        source_id: "q2_review.txt".to_string(),
        page_number: 3,
        relevance_score: 0.6,
    }];
    let generator = ScriptedGenerator::new(vec![Ok(reply(GOOD_NARRATIVE))]);
    let output = pipeline_with(Arc::new(StaticRetriever(chunks)), generator.clone(), 1)
        .run(&period())
        .await
        .unwrap();

    assert_eq!(output.chunks.len(), 1);
    let prompt = generator.request(0).user_prompt;
    assert!(prompt.contains("[q2_review.txt p.3]"));
    assert!(prompt.contains("market volatility"));
    assert!(prompt.contains("geopolitical factors"));
}

#[tokio::test]
async fn test_unavailable_stat_in_record_fails() {
    let mut candidate = record_json(GOOD_NARRATIVE);
    candidate["key_stats"]["dxy_chg"] = json!(-2.1);
    let generator = ScriptedGenerator::always(&candidate.to_string(), 2);

    let failure = pipeline_with(no_docs(), generator, 1)
        .run(&period())
        .await
        .unwrap_err();
    assert_eq!(failure.validation_kinds, vec![FailureKind::NumericMismatch]);
    assert!(failure.violations[0].contains("dxy_chg"));
}

#[tokio::test]
async fn test_snapshot_failure_is_external() {
    let generator = ScriptedGenerator::new(vec![Ok(reply(GOOD_NARRATIVE))]);
    let pipeline = MarketContextPipeline::new(no_docs(), Arc::new(BrokenSnapshots), generator.clone());

    let failure = pipeline.run(&period()).await.unwrap_err();
    assert_eq!(failure.kind, FailureKind::ExternalFailure);
    assert!(failure.reason.contains("feed unreachable"));
    assert_eq!(generator.calls(), 0);
}

#[tokio::test]
async fn test_model_failure_is_external_and_keeps_budget() {
    let generator = ScriptedGenerator::new(vec![
        Ok(reply(INVENTED_NUMBER)),
        Err(MarketContextError::RetriesExhausted {
            attempts: 4,
            last_error: "HTTP 503".into(),
        }),
    ]);
    let failure = pipeline_with(no_docs(), generator, 1)
        .run(&period())
        .await
        .unwrap_err();

    assert_eq!(failure.kind, FailureKind::ExternalFailure);
    assert_eq!(failure.revisions, 0);
    assert!(failure.reason.contains("HTTP 503"));
    assert_eq!(failure.last_draft, Some(record_json(INVENTED_NUMBER)));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_is_retried_without_consuming_budget() {
    let inner = Arc::new(SlowThenReady {
        calls: Mutex::new(0),
        reply: reply(GOOD_NARRATIVE),
    });
    let guarded = GuardedGenerator::new(
        inner.clone(),
        Arc::new(RateLimiter::new(RateLimits::default())),
        CallPolicy {
            timeout: Duration::from_secs(10),
            max_retries: 2,
            base_backoff: Duration::from_millis(50),
            max_jitter: Duration::ZERO,
        },
    );

    let output = pipeline_with(no_docs(), Arc::new(guarded), 0)
        .run(&period())
        .await
        .unwrap();

    assert_eq!(output.revisions, 0);
    assert_eq!(*inner.calls.lock().unwrap(), 2);
}

#[tokio::test]
async fn test_concurrent_runs_share_one_pipeline() {
    struct EchoPeriod;

    #[async_trait]
    impl TextGenerator for EchoPeriod {
        async fn generate(&self, request: &GenerationRequest) -> Result<String> {
            let period = if request.user_prompt.contains("period 2025-Q1") {
                "2025-Q1"
            } else {
                "2025-Q2"
            };
            let mut record = record_json(GOOD_NARRATIVE);
            record["period"] = json!(period);
            Ok(record.to_string())
        }
    }

    let pipeline = Arc::new(pipeline_with(no_docs(), Arc::new(EchoPeriod), 1));
    let handles: Vec<_> = ["2025-Q1", "2025-Q2", "2025-Q1", "2025-Q2"]
        .into_iter()
        .map(|label| {
            let pipeline = pipeline.clone();
            tokio::spawn(async move {
                let period = Period::parse(label).unwrap();
                pipeline.run(&period).await.map(|out| out.record.period)
            })
        })
        .collect();

    for (handle, label) in handles.into_iter().zip(["2025-Q1", "2025-Q2", "2025-Q1", "2025-Q2"]) {
        assert_eq!(handle.await.unwrap().unwrap(), label);
    }
}

#[tokio::test]
async fn test_end_to_end_with_files() -> anyhow::Result<()> {
    let docs = tempfile::tempdir()?;
    let snapshots_dir = tempfile::tempdir()?;
    tokio::fs::write(
        docs.path().join("q2_review.txt"),
        "Market trends for 2025-Q2: the Federal Reserve held rates as inflation cooled.\n\nOffice closure notice.",
    )
    .await?;

    let index = KeywordIndex::load_dir(docs.path()).await?;
    assert!(index.is_indexed());
    let store = FileSnapshotStore::new(snapshots_dir.path(), Arc::new(FixedMarketData::reference()));

    let narrative = "Equities returned 12.3 percent over the quarter, the ten-year yield closed at 4.25 percent and the dollar index fell 2.1 percent.";
    let reply = json!({
        "period": "2025-Q2",
        "headline": "Equities gained while the dollar softened",
        "macro_drivers": ["Federal Reserve on hold", "Cooling inflation"],
        "key_stats": { "sp500_tr": 12.3, "ust10y_yield": 4.25, "dxy_chg": -2.1 },
        "narrative": narrative,
        "sources": ["q2_review.txt"]
    })
    .to_string();
    let generator = ScriptedGenerator::new(vec![Ok(reply)]);

    let pipeline = MarketContextPipeline::new(Arc::new(index), Arc::new(store), generator.clone());
    let output = pipeline.run(&period()).await?;

    assert_eq!(output.chunks[0].source_id, "q2_review.txt");
    assert!(snapshots_dir.path().join("2025-Q2.json").exists());
    assert!(output.report.contains("| dxy_chg | -2.1 |"));
    assert!(generator.request(0).user_prompt.contains("monetary policy"));
    Ok(())
}
