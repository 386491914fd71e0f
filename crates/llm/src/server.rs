//! Orchestrator (C9): wires history, routing, upstream dispatch,
//! continuation and re-emission together behind the two entry points
//! [`lib`] calls.
//!
//! Deliberately a plain struct rather than a registry of pluggable
//! providers — this proxy always talks to exactly one upstream gateway, so
//! the multi-provider dispatch table this crate's server layer descends
//! from collapses to a single [`UpstreamClient`]. No metrics/tracing enum
//! wrapping, no token-rate-limiting layer: this proxy's job is dialect
//! translation and context management, not multi-tenant governance.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use config::{Config, ContinuationConfig, ToolsConfig};
use futures::stream::Stream;

use crate::continuation;
use crate::error::LlmError;
use crate::history::{HistoryEngine, SummaryFuture};
use crate::messages::openai;
use crate::messages::unified::{UnifiedChunk, UnifiedContentContainer, UnifiedRequest, UnifiedResponse};
use crate::request::RequestContext;
use crate::router::{ModelRouter, ModelTier};
use crate::summary_cache::SummaryCache;
use crate::upstream::UpstreamClient;

/// Builds an [`LlmHandler`] from the loaded configuration.
pub(crate) struct LlmServerBuilder<'a> {
    config: &'a Config,
}

impl<'a> LlmServerBuilder<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    pub async fn build(self) -> anyhow::Result<LlmHandler> {
        let summary_cache = Arc::new(SummaryCache::new(&self.config.summary_cache));
        let history = Arc::new(HistoryEngine::new(
            self.config.history.clone(),
            self.config.summary_cache.clone(),
            self.config.async_summary.clone(),
            summary_cache,
        ));
        let router = Arc::new(ModelRouter::new(self.config.model_routing.clone()));
        let upstream = Arc::new(UpstreamClient::new(self.config.upstream.clone()));

        Ok(LlmHandler {
            history,
            router,
            upstream,
            tools_config: self.config.tools.clone(),
            continuation_config: self.config.continuation.clone(),
            opus_model: self.config.upstream.opus_model.clone(),
            sonnet_model: self.config.upstream.sonnet_model.clone(),
            chars_per_token: self.config.history.chars_per_token,
        })
    }
}

pub(crate) struct LlmHandler {
    history: Arc<HistoryEngine>,
    router: Arc<ModelRouter>,
    upstream: Arc<UpstreamClient>,
    tools_config: ToolsConfig,
    continuation_config: ContinuationConfig,
    opus_model: String,
    sonnet_model: String,
    chars_per_token: f64,
}

impl LlmHandler {
    pub fn tools_config(&self) -> &ToolsConfig {
        &self.tools_config
    }

    pub fn chars_per_token(&self) -> f64 {
        self.chars_per_token
    }

    /// Non-streaming completion: history pre-process, route, dispatch, and
    /// on an upstream "too long" rejection, shrink and retry once per the
    /// history engine's own retry budget.
    pub async fn completions(&self, mut request: UnifiedRequest, context: &RequestContext) -> crate::Result<UnifiedResponse> {
        if let Some(tools) = &mut request.tools {
            crate::tool_codec::apply_description_limits(tools, &self.tools_config);
        }

        let summary_fn = self.summary_fn();
        self.history
            .pre_process_async(&mut request, &context.session_key, &summary_fn)
            .await;
        let decision = self.router.route(&request, context);

        let mut retry_count = 0u32;
        loop {
            match self.upstream.chat_completion(request.clone(), decision.tier).await {
                Ok(mut response) => {
                    crate::tool_codec::apply_legacy_extraction(&mut response, &self.tools_config);
                    return Ok(response);
                }
                Err(LlmError::InvalidRequest(message)) if looks_like_length_error(&message) => {
                    let retried = self
                        .history
                        .handle_length_error(&mut request, retry_count, &context.session_key, &summary_fn)
                        .await;
                    if !retried {
                        return Err(LlmError::InvalidRequest(message));
                    }
                    retry_count += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Streaming completion: same pre-processing and routing as
    /// [`Self::completions`], but the returned stream also carries bounded
    /// continuation (C8) — a `length` finish reason triggers a resume
    /// attempt transparently, so callers always see one logical stream.
    pub async fn completions_stream(
        &self,
        mut request: UnifiedRequest,
        context: &RequestContext,
    ) -> crate::Result<impl Stream<Item = crate::Result<UnifiedChunk>> + Send + use<>> {
        if let Some(tools) = &mut request.tools {
            crate::tool_codec::apply_description_limits(tools, &self.tools_config);
        }

        let summary_fn = self.summary_fn();
        self.history
            .pre_process_async(&mut request, &context.session_key, &summary_fn)
            .await;
        let decision = self.router.route(&request, context);

        let base_messages = request.messages.clone();
        let request_template = request.clone();
        let first_segment = self.upstream.chat_completion_stream(request, decision.tier).await?;

        Ok(continuation::continued_stream(
            self.continuation_config.clone(),
            self.history.clone(),
            self.router.clone(),
            self.upstream.clone(),
            base_messages,
            request_template,
            context.clone(),
            self.summary_fn(),
            Box::pin(first_segment),
        ))
    }

    /// Static descriptor list for the two tiers this proxy ever routes to.
    pub async fn models(&self) -> openai::ModelsResponse {
        let created = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);

        openai::ModelsResponse {
            object: openai::ObjectType::List,
            data: vec![
                openai::Model {
                    id: self.opus_model.clone(),
                    object: openai::ObjectType::Model,
                    created,
                    owned_by: "upstream".to_string(),
                },
                openai::Model {
                    id: self.sonnet_model.clone(),
                    object: openai::ObjectType::Model,
                    created,
                    owned_by: "upstream".to_string(),
                },
            ],
        }
    }

    /// Builds the closure C3 (history engine) calls to summarize older
    /// turns, closing over the upstream client so C3 never has to know
    /// C6's concrete type.
    fn summary_fn(&self) -> impl crate::history::SummaryFn + use<> {
        let upstream = self.upstream.clone();
        move |text: String| -> SummaryFuture {
            let upstream = upstream.clone();
            Box::pin(async move {
                let request = summary_request(text);
                let response = upstream
                    .chat_completion(request, ModelTier::Sonnet)
                    .await
                    .map_err(|e| anyhow::anyhow!(e.to_string()))?;
                Ok(response_text(&response))
            })
        }
    }
}

fn summary_request(transcript_prompt: String) -> UnifiedRequest {
    UnifiedRequest {
        model: "sonnet".to_string(),
        messages: vec![crate::messages::unified::UnifiedMessage {
            role: crate::messages::unified::UnifiedRole::User,
            content: UnifiedContentContainer::Text(transcript_prompt),
            tool_calls: None,
            tool_call_id: None,
        }],
        system: Some("You condense conversation history. Respond with the summary only.".to_string()),
        max_tokens: Some(512),
        temperature: Some(0.0),
        top_p: None,
        top_k: None,
        frequency_penalty: None,
        presence_penalty: None,
        stop_sequences: None,
        stream: Some(false),
        tools: None,
        tool_choice: None,
        parallel_tool_calls: None,
        metadata: None,
        extended_thinking: None,
    }
}

fn response_text(response: &UnifiedResponse) -> String {
    response
        .choices
        .first()
        .map(|choice| match &choice.message.content {
            UnifiedContentContainer::Text(text) => text.clone(),
            UnifiedContentContainer::Blocks(blocks) => blocks.iter().filter_map(|b| b.as_text()).collect::<Vec<_>>().join("\n"),
        })
        .unwrap_or_default()
}

/// The upstream gateway surfaces a too-long-context rejection as a 400; we
/// only have its message text to go on, so match the phrasing both OpenAI-
/// and Anthropic-shaped gateways commonly use for this condition.
fn looks_like_length_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("context_length_exceeded") || lower.contains("maximum context length") || lower.contains("too many tokens")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_common_length_error_phrasings() {
        assert!(looks_like_length_error("This model's maximum context length is 200000 tokens"));
        assert!(looks_like_length_error("error code: context_length_exceeded"));
        assert!(!looks_like_length_error("invalid api key"));
    }

    #[test]
    fn response_text_joins_block_content() {
        let response = UnifiedResponse {
            id: "resp_1".to_string(),
            model: "sonnet".to_string(),
            choices: vec![crate::messages::unified::UnifiedChoice {
                index: 0,
                message: crate::messages::unified::UnifiedMessage {
                    role: crate::messages::unified::UnifiedRole::Assistant,
                    content: UnifiedContentContainer::Text("condensed".to_string()),
                    tool_calls: None,
                    tool_call_id: None,
                },
                finish_reason: Some(crate::messages::unified::UnifiedFinishReason::Stop),
            }],
            usage: crate::messages::unified::UnifiedUsage {
                prompt_tokens: 1,
                completion_tokens: 1,
                total_tokens: 2,
            },
            created: 0,
            stop_reason: None,
            stop_sequence: None,
        };

        assert_eq!(response_text(&response), "condensed");
    }
}
