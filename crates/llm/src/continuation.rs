//! Continuation controller (C8): resumes a response the upstream cut off
//! at `max_tokens`, instead of handing the client a truncated answer.
//!
//! Wraps the first streaming segment and, on a `length` finish reason with
//! enough emitted text to be worth resuming, constructs a follow-up request
//! (original history + what's been emitted so far + a synthetic "please
//! continue") and re-runs history/routing/upstream dispatch for another
//! segment. Segments are concatenated into one logical `UnifiedChunk`
//! stream — the Anthropic re-emitter downstream never sees a seam, since it
//! only resets its `message_start`/content-block bookkeeping once per
//! stream, not once per upstream call.

use std::pin::Pin;
use std::sync::Arc;

use config::ContinuationConfig;
use futures::stream::{Stream, StreamExt};

use crate::history::{HistoryEngine, SummaryFn};
use crate::messages::unified::{
    UnifiedChunk, UnifiedContentContainer, UnifiedFinishReason, UnifiedMessage, UnifiedRequest, UnifiedRole,
};
use crate::request::RequestContext;
use crate::router::ModelRouter;
use crate::upstream::UpstreamClient;

const PLEASE_CONTINUE: &str = "Please continue exactly where you left off.";

struct State {
    remaining: Pin<Box<dyn Stream<Item = crate::Result<UnifiedChunk>> + Send>>,
    attempt: u32,
    emitted_so_far: String,
    last_finish_reason: Option<UnifiedFinishReason>,
    base_messages: Vec<UnifiedMessage>,
    done: bool,
}

/// Drives `first_segment` to completion, issuing bounded resume attempts
/// through `upstream`/`history`/`router` whenever the model is cut off
/// mid-answer, and yields one continuous chunk stream to the caller.
pub(crate) fn continued_stream<F: SummaryFn>(
    config: ContinuationConfig,
    history: Arc<HistoryEngine>,
    router: Arc<ModelRouter>,
    upstream: Arc<UpstreamClient>,
    base_messages: Vec<UnifiedMessage>,
    request_template: UnifiedRequest,
    context: RequestContext,
    summary_fn: F,
    first_segment: Pin<Box<dyn Stream<Item = crate::Result<UnifiedChunk>> + Send>>,
) -> impl Stream<Item = crate::Result<UnifiedChunk>> + Send + use<F> {
    let state = State {
        remaining: first_segment,
        attempt: 0,
        emitted_so_far: String::new(),
        last_finish_reason: None,
        base_messages,
        done: false,
    };

    futures::stream::unfold(state, move |mut state| {
        let config = config.clone();
        let history = history.clone();
        let router = router.clone();
        let upstream = upstream.clone();
        let request_template = request_template.clone();
        let context = context.clone();
        let summary_fn_ref = &summary_fn;

        async move {
            loop {
                if state.done {
                    return None;
                }

                match state.remaining.next().await {
                    Some(Ok(chunk)) => {
                        if let Some(choice) = chunk.choices.first() {
                            if let Some(text) = &choice.delta.content {
                                state.emitted_so_far.push_str(text);
                            }
                            if let Some(reason) = &choice.finish_reason {
                                state.last_finish_reason = Some(reason.clone());
                            }
                        }
                        return Some((Ok(chunk), state));
                    }
                    Some(Err(e)) => {
                        // Any upstream error during continuation terminates with
                        // accumulated content as final — surface the error once,
                        // then stop.
                        state.done = true;
                        return Some((Err(e), state));
                    }
                    None => {
                        if !should_continue(&config, &state) {
                            return None;
                        }

                        state.attempt += 1;
                        let resume_request = build_resume_request(&request_template, &state.base_messages, &state.emitted_so_far);

                        match dispatch_segment(&history, &router, &upstream, resume_request, &context, summary_fn_ref).await {
                            Ok(segment) => {
                                state.remaining = segment;
                                state.last_finish_reason = None;
                                continue;
                            }
                            Err(e) => {
                                state.done = true;
                                return Some((Err(e), state));
                            }
                        }
                    }
                }
            }
        }
    })
}

fn should_continue(config: &ContinuationConfig, state: &State) -> bool {
    if state.attempt >= config.max_continuation_attempts {
        return false;
    }
    if state.last_finish_reason != Some(UnifiedFinishReason::Length) {
        return false;
    }
    state.emitted_so_far.chars().count() >= config.min_resume_text_length
}

fn build_resume_request(template: &UnifiedRequest, base_messages: &[UnifiedMessage], emitted_so_far: &str) -> UnifiedRequest {
    let mut messages = base_messages.to_vec();
    messages.push(UnifiedMessage {
        role: UnifiedRole::Assistant,
        content: UnifiedContentContainer::Text(emitted_so_far.to_string()),
        tool_calls: None,
        tool_call_id: None,
    });
    messages.push(UnifiedMessage {
        role: UnifiedRole::User,
        content: UnifiedContentContainer::Text(PLEASE_CONTINUE.to_string()),
        tool_calls: None,
        tool_call_id: None,
    });

    let mut request = template.clone();
    request.messages = messages;
    request
}

async fn dispatch_segment<F: SummaryFn>(
    history: &HistoryEngine,
    router: &ModelRouter,
    upstream: &UpstreamClient,
    mut request: UnifiedRequest,
    context: &RequestContext,
    summary_fn: &F,
) -> crate::Result<Pin<Box<dyn Stream<Item = crate::Result<UnifiedChunk>> + Send>>> {
    history.pre_process_async(&mut request, &context.session_key, summary_fn).await;
    let decision = router.route(&request, context);
    let stream = upstream.chat_completion_stream(request, decision.tier).await?;
    Ok(Box::pin(stream))
}
