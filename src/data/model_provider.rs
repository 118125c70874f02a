use std::pin::Pin;

use async_trait::async_trait;
use futures_util::stream::{self, Stream, StreamExt};

/// One chunk of a streaming model response (§4.6 step 4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelChunk {
    Text(String),
    Reasoning(String),
    Thinking(String),
    ToolCall { name: String, args: String },
    ToolResult { name: String, result: String },
    Error(String),
}

pub type ModelChunkStream = Pin<Box<dyn Stream<Item = ModelChunk> + Send>>;

/// Abstraction over whichever model SDK answers a prompt. Real bindings are
/// out of scope; `FixtureModelProvider` below is the deterministic
/// replacement used by this core's own tests.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn stream(&self, system_context: &str, prompt: &str) -> ModelChunkStream;
}

/// Replays a fixed script of chunks regardless of input, so tests can assert
/// on exact SSE sequences without real model infrastructure.
pub struct FixtureModelProvider {
    script: Vec<ModelChunk>,
}

impl FixtureModelProvider {
    pub fn new(script: Vec<ModelChunk>) -> Self {
        Self { script }
    }

    /// A script that writes a single file, useful for the create→stream→preview
    /// end-to-end scenario.
    pub fn writing_file(path: &str, content: &str) -> Self {
        let tag = format!("<dyad-write path=\"{}\">{}</dyad-write>", path, content);
        Self::new(vec![
            ModelChunk::Text(format!("Sure, writing {}.\n", path)),
            ModelChunk::Text(tag),
        ])
    }
}

#[async_trait]
impl ModelProvider for FixtureModelProvider {
    async fn stream(&self, _system_context: &str, _prompt: &str) -> ModelChunkStream {
        Box::pin(stream::iter(self.script.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fixture_provider_replays_script_in_order() {
        let provider = FixtureModelProvider::new(vec![
            ModelChunk::Text("a".into()),
            ModelChunk::Text("b".into()),
        ]);
        let chunks: Vec<_> = provider.stream("ctx", "prompt").await.collect().await;
        assert_eq!(
            chunks,
            vec![ModelChunk::Text("a".into()), ModelChunk::Text("b".into())]
        );
    }
}
