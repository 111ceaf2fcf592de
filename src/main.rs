use log::info;
use market_context_builder::config::AppConfig;
use market_context_builder::llm::{GuardedGenerator, OpenAiClient, RateLimiter};
use market_context_builder::pipeline::MarketContextPipeline;
use market_context_builder::retrieval::KeywordIndex;
use market_context_builder::server::{router, AppState};
use market_context_builder::snapshot::{FileSnapshotStore, FixedMarketData};
use market_context_builder::Result;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env()?;

    let index = KeywordIndex::load_dir(&config.storage.documents_dir).await?;
    if index.is_empty() {
        info!("No documents indexed; drafts will rely on the snapshot alone");
    }

    let snapshots = FileSnapshotStore::new(
        config.storage.snapshot_dir.clone(),
        Arc::new(FixedMarketData::reference()),
    )
    .with_max_age(config.storage.snapshot_max_age)
    .with_pin_writes(config.storage.pin_snapshots);

    let client = OpenAiClient::new(config.require_api_key()?.to_string())
        .with_base_url(config.openai.base_url.clone())
        .with_model(config.openai.model.clone())
        .with_max_tokens(config.openai.max_tokens);
    let limiter = Arc::new(RateLimiter::new(config.rate_limits.clone()));
    let generator = GuardedGenerator::new(Arc::new(client), limiter, config.call_policy.clone());

    let pipeline = MarketContextPipeline::new(Arc::new(index), Arc::new(snapshots), Arc::new(generator))
        .with_validator(config.validator())
        .with_settings(config.pipeline.clone());

    let app = router(Arc::new(AppState { pipeline }));
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!("Listening on {} (model {})", config.bind_addr, config.openai.model);
    axum::serve(listener, app).await?;

    Ok(())
}
