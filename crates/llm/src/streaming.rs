//! Streaming re-emitter (C7): turns the upstream's flat `UnifiedChunk`
//! stream into the target dialect's real event sequence.
//!
//! For OpenAI-dialect output this is nearly a no-op: upstream already
//! speaks OpenAI chunk deltas, so `to_openai`'s lossless 1:1
//! `From<UnifiedChunk>` conversion is used directly at the call site in
//! `lib.rs`. Anthropic-dialect output needs an actual state machine,
//! because Anthropic's wire format separates `message_start`,
//! `content_block_start/delta/stop`, and `message_delta`/`message_stop`
//! into distinct events that a single upstream chunk cannot be mapped to
//! 1:1 — this module owns that sequencing.

use std::collections::VecDeque;
use std::pin::Pin;

use config::ToolsConfig;
use futures::stream::{Stream, StreamExt};

use crate::messages::anthropic::{
    AnthropicContent, AnthropicContentDelta, AnthropicMessageDelta, AnthropicStopReason, AnthropicStreamEvent,
    AnthropicStreamMessageStart, AnthropicUsage,
};
use crate::messages::unified::{UnifiedChunk, UnifiedFinishReason, UnifiedStreamingToolCall};
use crate::tool_codec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenBlock {
    Text,
    ToolUse,
}

/// Per-response state for the Anthropic output state machine:
/// `awaiting_start -> message_started -> content_open(index, kind) -> ... -> message_stopped`.
pub(crate) struct AnthropicReemitter {
    id: String,
    model: String,
    message_started: bool,
    open_block: Option<(u32, OpenBlock)>,
    next_index: u32,
    prompt_tokens: u32,
    completion_text_len: usize,
    stop_reason: Option<AnthropicStopReason>,
    legacy_text_buffer: String,
    tools_config: ToolsConfig,
    legacy_tool_mode: bool,
    /// Set once a native structured `tool_calls` delta has been seen for
    /// this response. A native-mode upstream that emits both a structured
    /// call and inline marker text for it should have the structured call
    /// win outright, so the inline-marker fallback scan (see
    /// `scans_for_inline_markers`) stops once this flips true.
    saw_native_tool_call: bool,
}

impl AnthropicReemitter {
    pub fn new(id: String, model: String, tools_config: ToolsConfig, legacy_tool_mode: bool) -> Self {
        Self {
            id,
            model,
            message_started: false,
            open_block: None,
            next_index: 0,
            prompt_tokens: 0,
            completion_text_len: 0,
            stop_reason: None,
            legacy_text_buffer: String::new(),
            tools_config,
            legacy_tool_mode,
            saw_native_tool_call: false,
        }
    }

    /// Whether the next text delta should be scanned for inline
    /// `[Calling tool: ...]` markers: always true in pure legacy mode, and
    /// true in native mode too as long as `native_tools_fallback_enabled`
    /// is set and this response hasn't already produced a structured tool
    /// call (once it has, structured wins and inline markers are left as
    /// plain text rather than double-invoking the same call).
    fn scans_for_inline_markers(&self) -> bool {
        self.legacy_tool_mode || (self.tools_config.native_tools_fallback_enabled && !self.saw_native_tool_call)
    }

    /// Processes one upstream chunk, returning the (possibly empty)
    /// sequence of Anthropic events it produces. `message_delta`/
    /// `message_stop` are withheld until [`Self::finish`] so that a
    /// trailing usage-only chunk still counts toward the final tally.
    pub fn process(&mut self, chunk: UnifiedChunk) -> Vec<AnthropicStreamEvent> {
        let mut events = Vec::new();

        if let Some(usage) = &chunk.usage {
            self.prompt_tokens = self.prompt_tokens.max(usage.prompt_tokens);
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return events;
        };

        if !self.message_started {
            self.message_started = true;
            events.push(AnthropicStreamEvent::MessageStart {
                message: AnthropicStreamMessageStart {
                    id: self.id.clone(),
                    message_type: "message".to_string(),
                    role: crate::messages::anthropic::AnthropicRole::Assistant,
                    content: Vec::new(),
                    model: self.model.clone(),
                    usage: AnthropicUsage {
                        input_tokens: self.prompt_tokens as i32,
                        output_tokens: 0,
                    },
                },
            });
        }

        if let Some(text) = choice.delta.content {
            self.completion_text_len += text.len();
            if self.scans_for_inline_markers() {
                events.extend(self.process_legacy_text(text));
            } else {
                events.extend(self.emit_text_delta(text));
            }
        }

        if let Some(tool_calls) = choice.delta.tool_calls {
            self.saw_native_tool_call = true;
            for call in tool_calls {
                events.extend(self.emit_tool_call(call));
            }
        }

        if let Some(finish_reason) = choice.finish_reason {
            self.stop_reason = Some(map_finish_reason(finish_reason));
        }

        events
    }

    fn emit_text_delta(&mut self, text: String) -> Vec<AnthropicStreamEvent> {
        let mut events = Vec::new();
        match self.open_block {
            Some((index, OpenBlock::Text)) => {
                events.push(AnthropicStreamEvent::ContentBlockDelta {
                    index,
                    delta: AnthropicContentDelta::TextDelta { text },
                });
            }
            _ => {
                events.extend(self.close_open_block());
                let index = self.next_index;
                self.next_index += 1;
                self.open_block = Some((index, OpenBlock::Text));
                events.push(AnthropicStreamEvent::ContentBlockStart {
                    index,
                    content_block: AnthropicContent::Text { text: String::new() },
                });
                events.push(AnthropicStreamEvent::ContentBlockDelta {
                    index,
                    delta: AnthropicContentDelta::TextDelta { text },
                });
            }
        }
        events
    }

    /// Buffers streamed text and scans the buffer for a complete inline
    /// `[Calling tool: ...] Input: {...}` marker on every chunk, rather
    /// than emitting raw text immediately — a marker can straddle many
    /// deltas, so nothing is safe to emit until it either resolves to a
    /// tool call or is far enough past to be confirmed as plain text.
    fn process_legacy_text(&mut self, text: String) -> Vec<AnthropicStreamEvent> {
        self.legacy_text_buffer.push_str(&text);
        let mut events = Vec::new();

        let result = tool_codec::extract_blocks(&self.legacy_text_buffer, &self.tools_config);
        if result.calls.is_empty() {
            // No complete marker yet. Only flush text that can no longer be
            // the start of a marker, to avoid emitting a prefix of
            // "[Calling tool: " as plain text moments before it resolves.
            if let Some(safe_len) = safe_flush_len(&self.legacy_text_buffer) {
                let flushed: String = self.legacy_text_buffer.drain(..safe_len).collect();
                if !flushed.is_empty() {
                    events.extend(self.emit_text_delta(flushed));
                }
            }
            return events;
        }

        let mut cursor = 0usize;
        for call in &result.calls {
            let prefix = self.legacy_text_buffer[cursor..call.span.start].to_string();
            if !prefix.is_empty() {
                events.extend(self.emit_text_delta(prefix));
            }
            events.extend(self.close_open_block());
            let index = self.next_index;
            self.next_index += 1;
            events.push(AnthropicStreamEvent::ContentBlockStart {
                index,
                content_block: AnthropicContent::ToolUse {
                    id: format!("toolu_{index}"),
                    name: call.name.clone(),
                    input: call.input.clone(),
                },
            });
            events.push(AnthropicStreamEvent::ContentBlockStop { index });
            cursor = call.span.end;
        }
        self.legacy_text_buffer.drain(..cursor);

        events
    }

    fn emit_tool_call(&mut self, call: UnifiedStreamingToolCall) -> Vec<AnthropicStreamEvent> {
        let mut events = Vec::new();
        match call {
            UnifiedStreamingToolCall::Start { id, function, .. } => {
                events.extend(self.close_open_block());
                let index = self.next_index;
                self.next_index += 1;
                self.open_block = Some((index, OpenBlock::ToolUse));
                let input = serde_json::from_str(&function.arguments).unwrap_or(serde_json::Value::Null);
                let input = if input.is_null() {
                    serde_json::Value::Object(serde_json::Map::new())
                } else {
                    input
                };
                events.push(AnthropicStreamEvent::ContentBlockStart {
                    index,
                    content_block: AnthropicContent::ToolUse { id, name: function.name, input },
                });
            }
            UnifiedStreamingToolCall::Delta { function, .. } => {
                if let Some((index, OpenBlock::ToolUse)) = self.open_block {
                    events.push(AnthropicStreamEvent::ContentBlockDelta {
                        index,
                        delta: AnthropicContentDelta::InputJsonDelta {
                            partial_json: function.arguments,
                        },
                    });
                }
            }
        }
        events
    }

    fn close_open_block(&mut self) -> Vec<AnthropicStreamEvent> {
        if let Some((index, _)) = self.open_block.take() {
            vec![AnthropicStreamEvent::ContentBlockStop { index }]
        } else {
            Vec::new()
        }
    }

    /// Called once the upstream stream has ended: flushes any buffered
    /// legacy text, closes the open content block, and emits the final
    /// `message_delta`/`message_stop` pair.
    pub fn finish(mut self) -> Vec<AnthropicStreamEvent> {
        let mut events = Vec::new();

        if !self.legacy_text_buffer.is_empty() {
            let remaining = std::mem::take(&mut self.legacy_text_buffer);
            events.extend(self.emit_text_delta(remaining));
        }

        events.extend(self.close_open_block());

        if !self.message_started {
            // Stream produced no content at all; still need a well-formed
            // envelope so the client doesn't hang waiting for message_start.
            events.push(AnthropicStreamEvent::MessageStart {
                message: AnthropicStreamMessageStart {
                    id: self.id.clone(),
                    message_type: "message".to_string(),
                    role: crate::messages::anthropic::AnthropicRole::Assistant,
                    content: Vec::new(),
                    model: self.model.clone(),
                    usage: AnthropicUsage {
                        input_tokens: self.prompt_tokens as i32,
                        output_tokens: 0,
                    },
                },
            });
        }

        let output_tokens = estimate_output_tokens(self.completion_text_len);

        events.push(AnthropicStreamEvent::MessageDelta {
            delta: AnthropicMessageDelta {
                stop_reason: Some(self.stop_reason.unwrap_or(AnthropicStopReason::EndTurn)),
                stop_sequence: None,
            },
            usage: AnthropicUsage {
                input_tokens: self.prompt_tokens as i32,
                output_tokens: output_tokens as i32,
            },
        });
        events.push(AnthropicStreamEvent::MessageStop);

        events
    }
}

fn estimate_output_tokens(char_len: usize) -> u32 {
    (char_len as f64 / 4.0).ceil() as u32
}

fn map_finish_reason(reason: UnifiedFinishReason) -> AnthropicStopReason {
    match reason {
        UnifiedFinishReason::Stop => AnthropicStopReason::EndTurn,
        UnifiedFinishReason::Length => AnthropicStopReason::MaxTokens,
        UnifiedFinishReason::ContentFilter => AnthropicStopReason::EndTurn,
        UnifiedFinishReason::ToolCalls => AnthropicStopReason::ToolUse,
    }
}

/// The longest prefix of `buffer` that cannot possibly be (the start of) a
/// `[Calling tool: ` marker, and so is safe to flush as plain text. Returns
/// `None` if the whole buffer might still turn into a marker.
fn safe_flush_len(buffer: &str) -> Option<usize> {
    const MARKER: &str = "[Calling tool: ";
    for start in 0..buffer.len() {
        if !buffer.is_char_boundary(start) {
            continue;
        }
        let tail = &buffer[start..];
        if MARKER.starts_with(tail) || tail.starts_with(MARKER) {
            return if start == 0 { None } else { Some(start) };
        }
    }
    Some(buffer.len())
}

/// Drives a `Stream<Item = Result<UnifiedChunk>>` through the Anthropic
/// state machine, yielding the real Anthropic SSE event sequence.
pub(crate) fn reemit_anthropic_stream(
    inner: Pin<Box<dyn Stream<Item = crate::Result<UnifiedChunk>> + Send>>,
    id: String,
    model: String,
    tools_config: ToolsConfig,
    legacy_tool_mode: bool,
) -> impl Stream<Item = crate::Result<AnthropicStreamEvent>> + Send {
    let reemitter = AnthropicReemitter::new(id, model, tools_config, legacy_tool_mode);

    futures::stream::unfold(
        State::Running {
            inner,
            reemitter,
            pending: VecDeque::new(),
        },
        |state| async move {
            let mut state = state;
            loop {
                match state {
                    State::Running {
                        mut inner,
                        mut reemitter,
                        mut pending,
                    } => {
                        if let Some(event) = pending.pop_front() {
                            return Some((Ok(event), State::Running { inner, reemitter, pending }));
                        }

                        match inner.next().await {
                            Some(Ok(chunk)) => {
                                pending.extend(reemitter.process(chunk));
                                state = State::Running { inner, reemitter, pending };
                                continue;
                            }
                            Some(Err(e)) => {
                                return Some((Err(e), State::Done));
                            }
                            None => {
                                let mut closing: VecDeque<_> = reemitter.finish().into();
                                let Some(first) = closing.pop_front() else {
                                    return None;
                                };
                                return Some((Ok(first), State::Draining { pending: closing }));
                            }
                        }
                    }
                    State::Draining { mut pending } => {
                        let Some(event) = pending.pop_front() else {
                            return None;
                        };
                        return Some((Ok(event), State::Draining { pending }));
                    }
                    State::Done => return None,
                }
            }
        },
    )
}

enum State {
    Running {
        inner: Pin<Box<dyn Stream<Item = crate::Result<UnifiedChunk>> + Send>>,
        reemitter: AnthropicReemitter,
        pending: VecDeque<AnthropicStreamEvent>,
    },
    Draining {
        pending: VecDeque<AnthropicStreamEvent>,
    },
    Done,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::unified::{UnifiedChoiceDelta, UnifiedFunctionDelta, UnifiedFunctionStart, UnifiedMessageDelta};
    use std::borrow::Cow;

    fn tools_config() -> ToolsConfig {
        ToolsConfig {
            native_tools_enabled: true,
            native_tools_fallback_enabled: true,
            tool_desc_max_chars: 1024,
            tool_param_desc_max_chars: 512,
        }
    }

    fn text_chunk(text: &str) -> UnifiedChunk {
        UnifiedChunk {
            id: Cow::Borrowed("chunk"),
            model: Cow::Borrowed("sonnet"),
            choices: vec![UnifiedChoiceDelta {
                index: 0,
                delta: UnifiedMessageDelta {
                    role: None,
                    content: Some(text.to_string()),
                    tool_calls: None,
                },
                finish_reason: None,
            }],
            usage: None,
            created: 0,
        }
    }

    fn finish_chunk(reason: UnifiedFinishReason) -> UnifiedChunk {
        UnifiedChunk {
            id: Cow::Borrowed("chunk"),
            model: Cow::Borrowed("sonnet"),
            choices: vec![UnifiedChoiceDelta {
                index: 0,
                delta: UnifiedMessageDelta {
                    role: None,
                    content: None,
                    tool_calls: None,
                },
                finish_reason: Some(reason),
            }],
            usage: None,
            created: 0,
        }
    }

    #[test]
    fn first_text_chunk_opens_message_and_block() {
        let mut reemitter = AnthropicReemitter::new("msg_1".to_string(), "sonnet".to_string(), tools_config(), false);
        let events = reemitter.process(text_chunk("hello"));

        assert!(matches!(events[0], AnthropicStreamEvent::MessageStart { .. }));
        assert!(matches!(events[1], AnthropicStreamEvent::ContentBlockStart { index: 0, .. }));
        assert!(matches!(events[2], AnthropicStreamEvent::ContentBlockDelta { index: 0, .. }));
    }

    #[test]
    fn subsequent_text_chunks_only_emit_delta() {
        let mut reemitter = AnthropicReemitter::new("msg_1".to_string(), "sonnet".to_string(), tools_config(), false);
        reemitter.process(text_chunk("hello"));
        let events = reemitter.process(text_chunk(" world"));

        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], AnthropicStreamEvent::ContentBlockDelta { index: 0, .. }));
    }

    #[test]
    fn finish_closes_block_and_emits_stop_sequence() {
        let mut reemitter = AnthropicReemitter::new("msg_1".to_string(), "sonnet".to_string(), tools_config(), false);
        reemitter.process(text_chunk("hello"));
        reemitter.process(finish_chunk(UnifiedFinishReason::Stop));
        let events = reemitter.finish();

        assert!(matches!(events[0], AnthropicStreamEvent::ContentBlockStop { index: 0 }));
        assert!(matches!(events[1], AnthropicStreamEvent::MessageDelta { .. }));
        assert!(matches!(events[2], AnthropicStreamEvent::MessageStop));
    }

    #[test]
    fn native_tool_call_start_then_delta_opens_tool_use_block() {
        let mut reemitter = AnthropicReemitter::new("msg_1".to_string(), "sonnet".to_string(), tools_config(), false);
        let start_chunk = UnifiedChunk {
            id: Cow::Borrowed("c"),
            model: Cow::Borrowed("sonnet"),
            choices: vec![UnifiedChoiceDelta {
                index: 0,
                delta: UnifiedMessageDelta {
                    role: None,
                    content: None,
                    tool_calls: Some(vec![UnifiedStreamingToolCall::Start {
                        index: 0,
                        id: "call_1".to_string(),
                        function: UnifiedFunctionStart {
                            name: "get_weather".to_string(),
                            arguments: String::new(),
                        },
                    }]),
                },
                finish_reason: None,
            }],
            usage: None,
            created: 0,
        };

        let events = reemitter.process(start_chunk);
        assert!(events.iter().any(|e| matches!(e, AnthropicStreamEvent::ContentBlockStart {
            content_block: AnthropicContent::ToolUse { .. },
            ..
        })));

        let delta_chunk = UnifiedChunk {
            id: Cow::Borrowed("c"),
            model: Cow::Borrowed("sonnet"),
            choices: vec![UnifiedChoiceDelta {
                index: 0,
                delta: UnifiedMessageDelta {
                    role: None,
                    content: None,
                    tool_calls: Some(vec![UnifiedStreamingToolCall::Delta {
                        index: 0,
                        function: UnifiedFunctionDelta {
                            arguments: "{\"location\":".to_string(),
                        },
                    }]),
                },
                finish_reason: None,
            }],
            usage: None,
            created: 0,
        };
        let events = reemitter.process(delta_chunk);
        assert!(matches!(events[0], AnthropicStreamEvent::ContentBlockDelta { .. }));
    }

    #[test]
    fn legacy_mode_buffers_until_marker_resolves() {
        let mut reemitter = AnthropicReemitter::new("msg_1".to_string(), "sonnet".to_string(), tools_config(), true);
        let events = reemitter.process(text_chunk("Sure, let me check. [Calling tool: get_weather"));
        // Nothing resolved yet; marker is incomplete, no tool-use event yet.
        assert!(events.iter().all(|e| !matches!(e, AnthropicStreamEvent::ContentBlockStart {
            content_block: AnthropicContent::ToolUse { .. },
            ..
        })));

        let events = reemitter.process(text_chunk("] Input: {\"location\": \"Paris\"}"));
        assert!(events.iter().any(|e| matches!(e, AnthropicStreamEvent::ContentBlockStart {
            content_block: AnthropicContent::ToolUse { .. },
            ..
        })));
    }
}
