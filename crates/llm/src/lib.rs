use std::{convert::Infallible, sync::Arc};

use axum::{
    Router,
    extract::{Json, State},
    http::HeaderMap,
    response::{IntoResponse, Sse, sse::Event},
    routing::{get, post},
};
use axum_serde::Sonic;
use futures::StreamExt;
use messages::{anthropic, openai};

mod continuation;
mod error;
mod history;
mod http_client;
mod messages;
mod request;
mod router;
mod server;
mod streaming;
mod summary_cache;
mod token_counter;
mod tool_codec;
mod upstream;

pub use error::{AnthropicResult, LlmError, LlmResult as Result};
use server::{LlmHandler, LlmServerBuilder};

use crate::messages::unified;

/// Creates an axum router wiring both dialect surfaces onto one handler.
///
/// Both protocol surfaces are always mounted; this proxy always serves both
/// dialects rather than making either one optional.
pub async fn router(config: &config::Config) -> anyhow::Result<Router> {
    let server = Arc::new(
        LlmServerBuilder::new(config)
            .build()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to initialize LLM server: {e}"))?,
    );

    Ok(Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .route("/v1/messages", post(anthropic_messages))
        .route("/v1/messages/count_tokens", post(anthropic_count_tokens))
        .with_state(server))
}

/// Handle chat completion requests.
///
/// This endpoint supports both streaming and non-streaming responses.
/// When `stream: true` is set in the request, the response is sent as
/// Server-Sent Events (SSE). Otherwise, a standard JSON response is returned.
async fn chat_completions(
    State(server): State<Arc<LlmHandler>>,
    headers: HeaderMap,
    Sonic(request): Sonic<openai::ChatCompletionRequest>,
) -> Result<impl IntoResponse> {
    log::debug!("OpenAI chat completions handler called for model: {}", request.model);
    log::debug!("Request has {} messages", request.messages.len());
    log::debug!("Streaming: {}", request.stream.unwrap_or(false));

    let streaming = request.stream.unwrap_or(false);
    let mut unified_request = unified::UnifiedRequest::from(request);
    let report = unified_request.normalize(true);
    if !report.is_noop() {
        log::debug!("normalized request: {report:?}");
    }
    let context = request::extract_context(&headers, &unified_request);

    if streaming {
        let stream = server.completions_stream(unified_request, &context).await?;

        let event_stream = stream.map(move |result| {
            let event = match result {
                Ok(unified_chunk) => {
                    let openai_chunk = openai::ChatCompletionChunk::from(unified_chunk);
                    let json = sonic_rs::to_string(&openai_chunk).unwrap_or_else(|e| {
                        log::error!("Failed to serialize chunk: {e}");
                        r#"{"error":"serialization failed"}"#.to_string()
                    });

                    Event::default().data(json)
                }
                Err(e) => {
                    log::error!("Stream error: {e}");
                    Event::default().data(format!(r#"{{"error":"{e}"}}"#))
                }
            };

            Ok::<_, Infallible>(event)
        });

        let with_done = event_stream.chain(futures::stream::once(async {
            Ok::<_, Infallible>(Event::default().data("[DONE]"))
        }));

        log::debug!("Returning streaming response");
        Ok(Sse::new(with_done).into_response())
    } else {
        let unified_response = server.completions(unified_request, &context).await?;
        let response = openai::ChatCompletionResponse::from(unified_response);

        log::debug!(
            "Chat completion successful, returning response with {} choices",
            response.choices.len()
        );

        Ok(Json(response).into_response())
    }
}

/// Handle list models requests.
async fn list_models(State(server): State<Arc<LlmHandler>>) -> Result<impl IntoResponse> {
    let response = server.models().await;

    log::debug!("Returning {} models", response.data.len());
    Ok(Json(response))
}

/// Handle Anthropic messages requests.
///
/// This endpoint supports both streaming and non-streaming responses.
/// When `stream: true` is set in the request, the response is sent as
/// Server-Sent Events (SSE). Otherwise, a standard JSON response is returned.
async fn anthropic_messages(
    State(server): State<Arc<LlmHandler>>,
    headers: HeaderMap,
    Sonic(request): Sonic<anthropic::AnthropicChatRequest>,
) -> AnthropicResult<impl IntoResponse> {
    log::debug!("Anthropic messages handler called for model: {}", request.model);
    log::debug!("Request has {} messages", request.messages.len());
    log::debug!("Streaming: {}", request.stream.unwrap_or(false));

    let mut unified_request = unified::UnifiedRequest::from(request);
    let report = unified_request.normalize(true);
    if !report.is_noop() {
        log::debug!("normalized request: {report:?}");
    }
    let context = request::extract_context(&headers, &unified_request);

    if unified_request.stream.unwrap_or(false) {
        let message_id = format!("msg_{}", uuid::Uuid::new_v4().simple());
        let model = unified_request.model.clone();
        let tools_config = server.tools_config().clone();
        let legacy_tool_mode = !tools_config.native_tools_enabled;

        let raw_stream = server.completions_stream(unified_request, &context).await?;
        let anthropic_stream = streaming::reemit_anthropic_stream(
            Box::pin(raw_stream),
            message_id,
            model,
            tools_config,
            legacy_tool_mode,
        );

        let event_stream = anthropic_stream.map(move |result| {
            let event = match result {
                Ok(anthropic_event) => {
                    let json = sonic_rs::to_string(&anthropic_event).unwrap_or_else(|e| {
                        log::error!("Failed to serialize Anthropic streaming event: {e}");
                        r#"{"error":"serialization failed"}"#.to_string()
                    });

                    Event::default().data(json)
                }
                Err(e) => {
                    log::error!("Stream error: {e}");
                    let anthropic_error = anthropic::AnthropicError::from(e);
                    let error_event = anthropic::AnthropicStreamEvent::Error {
                        error: anthropic_error.error,
                    };
                    let json = sonic_rs::to_string(&error_event).unwrap_or_else(|se| {
                        log::error!("Failed to serialize Anthropic stream error event: {se}");
                        r#"{"type":"error","error":{"type":"internal_error","message":"serialization failed"}}"#
                            .to_string()
                    });

                    Event::default().data(json)
                }
            };

            Ok::<_, Infallible>(event)
        });

        log::debug!("Returning Anthropic streaming response");

        Ok(Sse::new(event_stream).into_response())
    } else {
        let unified_response = server.completions(unified_request, &context).await?;
        let anthropic_response = anthropic::AnthropicChatResponse::from(unified_response);

        log::debug!("Anthropic messages completion successful");

        Ok(Json(anthropic_response).into_response())
    }
}

/// Handle `/v1/messages/count_tokens`, estimating usage without calling upstream.
///
/// This never reaches the upstream gateway: it runs the same heuristic the
/// history engine uses to decide whether a request needs truncating.
async fn anthropic_count_tokens(
    State(server): State<Arc<LlmHandler>>,
    Sonic(request): Sonic<anthropic::AnthropicChatRequest>,
) -> AnthropicResult<impl IntoResponse> {
    let unified_request = unified::UnifiedRequest::from(request);
    let input_tokens = token_counter::estimate_request_tokens(&unified_request, server.chars_per_token());

    Ok(Json(serde_json::json!({ "input_tokens": input_tokens })))
}
