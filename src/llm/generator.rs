use crate::error::Result;
use crate::llm::types::GenerationRequest;
use async_trait::async_trait;
use std::sync::Arc;

/// A language-model backend. Implementations return the raw completion text;
/// parsing and validation happen downstream.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<String>;
}

#[async_trait]
impl<T: TextGenerator + ?Sized> TextGenerator for Arc<T> {
    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        (**self).generate(request).await
    }
}
