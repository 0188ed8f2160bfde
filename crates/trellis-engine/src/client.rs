//! The provider seam: an opaque streaming LLM client.
//!
//! Provider adapters (OpenAI, Claude, Gemini, local runtimes) live outside
//! the core and implement [`LlmClient`]. The executor hands them the
//! pipeline's canonical message list and consumes a channel of chunks.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use trellis_core::{SamplingParams, TokenUsage};
use trellis_pipeline::DraftMessage;

/// Classification of streaming failures, mapped from provider-specific
/// errors by the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    Network,
    Auth,
    RateLimit,
    Timeout,
    ContentFilter,
    Cancelled,
    Unknown,
}

impl fmt::Display for LlmErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LlmErrorKind::Network => "network",
            LlmErrorKind::Auth => "auth",
            LlmErrorKind::RateLimit => "rate_limit",
            LlmErrorKind::Timeout => "timeout",
            LlmErrorKind::ContentFilter => "content_filter",
            LlmErrorKind::Cancelled => "cancelled",
            LlmErrorKind::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("llm stream error ({kind}): {message}")]
pub struct LlmError {
    pub kind: LlmErrorKind,
    pub message: String,
}

impl LlmError {
    pub fn new(kind: LlmErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::Network, message)
    }

    pub fn cancelled() -> Self {
        Self::new(LlmErrorKind::Cancelled, "operation cancelled")
    }

    pub fn timeout() -> Self {
        Self::new(LlmErrorKind::Timeout, "request timed out")
    }
}

/// One request to a provider.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    /// Canonical message list from the pipeline's terminal stage.
    pub messages: Vec<DraftMessage>,
    pub sampling: SamplingParams,
    pub timeout: Duration,
    /// Cooperative stop signal; adapters check it at I/O points.
    pub cancel: CancellationToken,
}

/// One streamed chunk. All fields optional: providers interleave text,
/// reasoning, and bookkeeping freely.
#[derive(Debug, Clone, Default)]
pub struct StreamChunk {
    pub text_delta: Option<String>,
    pub reasoning_delta: Option<String>,
    pub usage: Option<TokenUsage>,
    pub finish_reason: Option<String>,
}

impl StreamChunk {
    pub fn text(delta: impl Into<String>) -> Self {
        Self {
            text_delta: Some(delta.into()),
            ..Self::default()
        }
    }

    pub fn reasoning(delta: impl Into<String>) -> Self {
        Self {
            reasoning_delta: Some(delta.into()),
            ..Self::default()
        }
    }

    pub fn done(usage: TokenUsage, finish_reason: impl Into<String>) -> Self {
        Self {
            usage: Some(usage),
            finish_reason: Some(finish_reason.into()),
            ..Self::default()
        }
    }

    pub fn has_delta(&self) -> bool {
        self.text_delta.is_some() || self.reasoning_delta.is_some()
    }
}

/// Common interface for all LLM providers.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Provider name for logging and error messages.
    fn name(&self) -> &str;

    /// Stream response chunks through the channel, returning once the stream
    /// finishes. A dropped receiver or a fired cancellation token ends the
    /// stream early; cancelled streams return `Err` with kind `Cancelled`.
    async fn stream(
        &self,
        request: ChatRequest,
        tx: mpsc::Sender<StreamChunk>,
    ) -> Result<(), LlmError>;
}
