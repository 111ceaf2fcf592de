//! HTTP surface: `POST /market-context?period=YYYY-QN` and `GET /health`.

use crate::error::FailureKind;
use crate::pipeline::{MarketContextPipeline, PipelineFailure};
use crate::retrieval::RetrievedChunk;
use crate::schema::MarketContextRecord;
use crate::utils::Period;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{error, info};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub struct AppState {
    pub pipeline: MarketContextPipeline,
}

#[derive(Debug)]
pub enum ApiError {
    /// 400 - malformed period
    BadRequest(String),
    /// 422 - validation still failing after the revision budget
    ValidationFailed(PipelineFailure),
    /// 502 - model provider or data source failed
    BadGateway(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    reasons: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    revisions: Option<u32>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    error: "invalid_period".into(),
                    message,
                    reasons: Vec::new(),
                    revisions: None,
                },
            ),
            ApiError::ValidationFailed(failure) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                ErrorBody {
                    error: failure.kind.to_string(),
                    message: failure.reason,
                    reasons: failure.violations,
                    revisions: Some(failure.revisions),
                },
            ),
            ApiError::BadGateway(message) => (
                StatusCode::BAD_GATEWAY,
                ErrorBody {
                    error: FailureKind::ExternalFailure.to_string(),
                    message,
                    reasons: Vec::new(),
                    revisions: None,
                },
            ),
        };

        (status, Json(body)).into_response()
    }
}

impl From<PipelineFailure> for ApiError {
    fn from(failure: PipelineFailure) -> Self {
        match failure.kind {
            FailureKind::ExternalFailure => ApiError::BadGateway(failure.reason),
            _ => ApiError::ValidationFailed(failure),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PeriodQuery {
    pub period: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MarketContextResponse {
    pub period: String,
    pub market_context: MarketContextRecord,
    /// Markdown rendering of `market_context`.
    pub report: String,
    pub revisions: u32,
    pub retrieval_degraded: bool,
    /// Recovered problems, e.g. `retrieval_degraded`.
    pub warnings: Vec<FailureKind>,
    pub retrieved_chunks: Vec<RetrievedChunk>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub documents_indexed: bool,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/market-context", post(generate_market_context))
        .route("/health", get(health))
        .with_state(state)
}

/// POST /market-context?period=YYYY-QN
pub async fn generate_market_context(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PeriodQuery>,
) -> Result<Json<MarketContextResponse>, ApiError> {
    let raw = query
        .period
        .ok_or_else(|| ApiError::BadRequest("query parameter 'period' is required".into()))?;
    let period = Period::parse(&raw).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    info!("Market context requested for {}", period);
    let output = state.pipeline.run(&period).await.map_err(|failure| {
        error!("Market context for {} failed: {}", period, failure);
        ApiError::from(failure)
    })?;

    let warnings = output.warnings();
    Ok(Json(MarketContextResponse {
        period: period.label(),
        market_context: output.record,
        report: output.report,
        revisions: output.revisions,
        retrieval_degraded: output.retrieval_degraded,
        warnings,
        retrieved_chunks: output.chunks,
    }))
}

/// GET /health
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        documents_indexed: state.pipeline.retriever().is_indexed(),
    })
}
