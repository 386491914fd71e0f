use axum::http::HeaderMap;
use sha2::{Digest, Sha256};

use crate::messages::unified::{UnifiedContentContainer, UnifiedRequest, UnifiedRole};

/// Header a caller can set to pin this request to the high-capability tier,
/// bypassing the router's heuristics entirely.
pub(crate) const FORCE_MODEL_HEADER: &str = "X-Force-Model";

/// Per-request context threaded through the orchestrator.
///
/// Unlike the provider-facing request types this carries no model-routing
/// state of its own — it exists to give every downstream component
/// (history engine, router, continuation controller, logging) a stable
/// identity for this call without re-deriving it at each step.
#[derive(Debug, Clone)]
pub(crate) struct RequestContext {
    /// Short opaque id, included in logs and the `X-Request-Id` response header.
    pub request_id: String,

    /// Stable hash of the conversation's leading turns, used to key the
    /// summary cache and to group continuation attempts under one logical
    /// request.
    pub session_key: String,

    /// Incoming request headers, kept around for the force-model override
    /// and any inline `[FORCE_OPUS]` marker inspection.
    pub headers: HeaderMap,
}

impl RequestContext {
    /// Value of the `X-Force-Model` header, if the caller set one.
    pub fn forced_model(&self) -> Option<&str> {
        self.headers.get(FORCE_MODEL_HEADER).and_then(|value| value.to_str().ok())
    }
}

/// Builds a [`RequestContext`] for an inbound call.
///
/// `session_key` is derived from the first few user turns of the
/// normalized request rather than the whole history, so that appending
/// messages to an ongoing conversation keeps hitting the same cache key.
pub(super) fn extract_context(headers: &HeaderMap, request: &UnifiedRequest) -> RequestContext {
    RequestContext {
        request_id: new_request_id(),
        session_key: session_key(request),
        headers: headers.clone(),
    }
}

fn new_request_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

const SESSION_KEY_TURNS: usize = 3;

fn session_key(request: &UnifiedRequest) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request.model.as_bytes());

    let mut counted = 0usize;
    for message in &request.messages {
        if message.role != UnifiedRole::User {
            continue;
        }
        match &message.content {
            UnifiedContentContainer::Text(text) => hasher.update(text.as_bytes()),
            UnifiedContentContainer::Blocks(blocks) => {
                for block in blocks {
                    if let Some(text) = block.as_text() {
                        hasher.update(text.as_bytes());
                    }
                }
            }
        }
        counted += 1;
        if counted >= SESSION_KEY_TURNS {
            break;
        }
    }

    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::unified::UnifiedMessage;

    fn request_with(messages: Vec<UnifiedMessage>) -> UnifiedRequest {
        UnifiedRequest {
            model: "sonnet".to_string(),
            messages,
            system: None,
            max_tokens: Some(100),
            temperature: None,
            top_p: None,
            top_k: None,
            frequency_penalty: None,
            presence_penalty: None,
            stop_sequences: None,
            stream: None,
            tools: None,
            tool_choice: None,
            parallel_tool_calls: None,
            metadata: None,
            extended_thinking: None,
        }
    }

    fn user(text: &str) -> UnifiedMessage {
        UnifiedMessage {
            role: UnifiedRole::User,
            content: UnifiedContentContainer::Text(text.to_string()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    #[test]
    fn session_key_is_stable_across_appended_turns() {
        let first = request_with(vec![user("hello there"), user("how are you")]);
        let extended = request_with(vec![user("hello there"), user("how are you"), user("one more thing")]);

        assert_eq!(session_key(&first), session_key(&extended));
    }

    #[test]
    fn session_key_differs_for_different_conversations() {
        let a = request_with(vec![user("hello there")]);
        let b = request_with(vec![user("goodbye now")]);

        assert_ne!(session_key(&a), session_key(&b));
    }

    #[test]
    fn forced_model_reads_header() {
        let mut headers = HeaderMap::new();
        headers.insert(FORCE_MODEL_HEADER, "opus".parse().unwrap());
        let context = extract_context(&headers, &request_with(vec![user("hi")]));

        assert_eq!(context.forced_model(), Some("opus"));
    }
}
