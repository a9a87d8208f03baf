//! Abstract ports the core consumes but never implements.
//!
//! The dispatcher itself never calls `ModelClient` — handlers do. These
//! traits exist purely so the core's handlers, triggers, and periodic
//! workers can be written against a stable interface while a host
//! application supplies the real model client, story persistence, and push
//! transport.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ModelMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub content: String,
    pub tool_calls: Vec<String>,
}

/// Distinguished failure surfaced when a model does not support tool
/// calling, so a handler can mark the model accordingly before retrying.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ModelCallError {
    #[error("tool calling is not supported by this model")]
    ToolUnsupported,
    #[error("model call failed: {0}")]
    Other(String),
}

#[async_trait]
pub trait ModelClient: Send + Sync + std::fmt::Debug {
    async fn call(
        &self,
        messages: &[ModelMessage],
        tools: &[String],
        token: CancellationToken,
    ) -> Result<ModelResponse, ModelCallError>;
}

#[derive(Debug, Clone, Default)]
pub struct EvaluationStats {
    pub count: u32,
    pub average: f64,
}

#[derive(Debug, Clone)]
pub struct StorySummary {
    pub id: Uuid,
    pub has_tagged_artifact: bool,
}

#[async_trait]
pub trait StoryStore: Send + Sync + std::fmt::Debug {
    async fn get_story(&self, id: Uuid) -> Option<StorySummary>;
    async fn get_evaluation_stats(&self, id: Uuid) -> EvaluationStats;
    async fn get_latest_model_response_result(&self, thread_id: u64) -> Option<String>;
}

#[async_trait]
pub trait Notifier: Send + Sync + std::fmt::Debug {
    /// Best-effort broadcast; implementations must never propagate an
    /// error back into the logger.
    async fn broadcast(&self, channel: &str, payload: HashMap<String, String>);
}
