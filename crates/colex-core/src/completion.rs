use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::types::{Completion, CompletionRequest};

/// Text-generation backend. Every extraction step and the chat loop go
/// through this seam; implementations live in `colex-agent`.
#[async_trait]
pub trait CompletionService: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion>;

    /// Like [`complete`](Self::complete) but forwards content deltas as they
    /// arrive. Backends without native streaming send the whole answer as
    /// one delta.
    async fn complete_streaming(
        &self,
        request: &CompletionRequest,
        deltas: mpsc::UnboundedSender<String>,
    ) -> Result<Completion> {
        let completion = self.complete(request).await?;
        if !completion.content.is_empty() {
            let _ = deltas.send(completion.content.clone());
        }
        Ok(completion)
    }
}
