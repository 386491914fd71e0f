//! Upstream client pool: the single outbound HTTP surface this proxy uses
//! to talk to the OpenAI-dialect gateway behind it.
//!
//! One shared `reqwest::Client` for the process lifetime (built in
//! [`crate::http_client`]), bounded by a semaphore standing in for a total
//! connection cap reqwest itself doesn't expose. Exposes one streaming and
//! one non-streaming call primitive; retries connection-reset and 5xx with
//! bounded backoff, but never retries a length-related 4xx here — that's
//! surfaced to the history engine (C3) and continuation controller (C8)
//! instead.

use std::sync::Arc;
use std::time::Duration;

use config::UpstreamConfig;
use eventsource_stream::Eventsource;
use futures::stream::{self, Stream, StreamExt};
use tokio::sync::Semaphore;

use crate::error::LlmError;
use crate::messages::openai;
use crate::messages::unified::{UnifiedChunk, UnifiedRequest, UnifiedResponse};
use crate::router::ModelTier;

pub(crate) struct UpstreamClient {
    client: reqwest::Client,
    config: UpstreamConfig,
    inflight: Arc<Semaphore>,
}

impl UpstreamClient {
    pub fn new(config: UpstreamConfig) -> Self {
        let client = crate::http_client::http_client(&config);
        let inflight = Arc::new(Semaphore::new(config.http_pool_max_connections));

        Self { client, config, inflight }
    }

    pub fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Opus => &self.config.opus_model,
            ModelTier::Sonnet => &self.config.sonnet_model,
        }
    }

    /// Non-streaming call with bounded retry on transient failures.
    pub async fn chat_completion(&self, request: UnifiedRequest, tier: ModelTier) -> crate::Result<UnifiedResponse> {
        let _permit = self.inflight.acquire().await.expect("semaphore not closed");

        let mut body = openai::ChatCompletionRequest::from(request);
        body.model = self.model_for(tier).to_string();
        body.stream = Some(false);

        let mut attempt = 0u32;
        loop {
            match self.try_chat_completion(&body).await {
                Ok(response) => return Ok(UnifiedResponse::from(response)),
                Err(e) if attempt < self.config.max_retries && is_retryable(&e) => {
                    attempt += 1;
                    log::warn!("upstream call failed (attempt {attempt}), retrying: {e}");
                    tokio::time::sleep(backoff(&self.config, attempt)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_chat_completion(&self, body: &openai::ChatCompletionRequest) -> crate::Result<openai::ChatCompletionResponse> {
        let response = self
            .dispatch(body)
            .await
            .map_err(|e| LlmError::ConnectionError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(map_status_error(status.as_u16(), message));
        }

        response
            .json::<openai::ChatCompletionResponse>()
            .await
            .map_err(|e| LlmError::InternalError(Some(format!("failed to parse upstream response: {e}"))))
    }

    /// Streaming call. The upstream speaks OpenAI dialect regardless of
    /// which client dialect this request came in on, so every SSE `data:`
    /// line is parsed as an `openai::ChatCompletionChunk` and converted
    /// into a `UnifiedChunk` before being handed to the re-emitter (C7).
    pub async fn chat_completion_stream(
        &self,
        request: UnifiedRequest,
        tier: ModelTier,
    ) -> crate::Result<impl Stream<Item = crate::Result<UnifiedChunk>> + Send + use<>> {
        let mut body = openai::ChatCompletionRequest::from(request);
        body.model = self.model_for(tier).to_string();
        body.stream = Some(true);

        let permit = self
            .inflight
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore not closed");

        let response = self
            .dispatch(&body)
            .await
            .map_err(|e| LlmError::ConnectionError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(map_status_error(status.as_u16(), message));
        }

        let event_stream = response.bytes_stream().eventsource();

        let stream = stream::unfold((Box::pin(event_stream), permit), |(mut stream, permit)| async move {
            loop {
                let event = stream.next().await?;
                let event = match event {
                    Ok(event) => event,
                    Err(e) => {
                        log::warn!("malformed SSE event from upstream: {e}");
                        continue;
                    }
                };

                if event.data == "[DONE]" {
                    return None;
                }

                match sonic_rs::from_str::<openai::ChatCompletionChunk>(&event.data) {
                    Ok(chunk) => return Some((Ok(UnifiedChunk::from(chunk)), (stream, permit))),
                    Err(e) => {
                        log::warn!("failed to parse upstream chunk, skipping: {e}");
                        continue;
                    }
                }
            }
        });

        Ok(stream)
    }

    async fn dispatch(&self, body: &openai::ChatCompletionRequest) -> reqwest::Result<reqwest::Response> {
        let url = format!("{}/v1/chat/completions", self.config.base_url.trim_end_matches('/'));
        let mut request = self.client.post(url).json(body);

        if let Some(token) = &self.config.bearer_token {
            request = request.bearer_auth(secrecy::ExposeSecret::expose_secret(token));
        }

        request.send().await
    }
}

fn is_retryable(error: &LlmError) -> bool {
    matches!(
        error,
        LlmError::ConnectionError(_) | LlmError::ProviderApiError { status: 500..=599, .. } | LlmError::InternalError(_)
    )
}

fn backoff(config: &UpstreamConfig, attempt: u32) -> Duration {
    Duration::from_millis(config.retry_backoff_base_ms.saturating_mul(1u64 << attempt.min(10)))
}

fn map_status_error(status: u16, message: String) -> LlmError {
    match status {
        401 => LlmError::AuthenticationFailed(message),
        403 => LlmError::InsufficientQuota(message),
        404 => LlmError::ModelNotFound(message),
        429 => LlmError::RateLimitExceeded { message },
        400 => LlmError::InvalidRequest(message),
        500 => LlmError::InternalError(Some(message)),
        _ => LlmError::ProviderApiError { status, message },
    }
}
