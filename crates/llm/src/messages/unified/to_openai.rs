//! Conversions from unified types to OpenAI protocol types.
//!
//! ZERO ALLOCATIONS - All data is moved, not cloned.

use crate::messages::{openai, unified};

impl From<unified::UnifiedRequest> for openai::ChatCompletionRequest {
    fn from(req: unified::UnifiedRequest) -> Self {
        // Convert messages and extract system messages
        let mut messages = Vec::with_capacity(req.messages.len() + if req.system.is_some() { 1 } else { 0 });

        // Add system message if present
        if let Some(system) = req.system {
            messages.push(openai::ChatMessage {
                role: openai::ChatRole::System,
                content: Some(system),
                tool_calls: None,
                tool_call_id: None,
            });
        }

        // Convert all messages, splitting a `tool_result`-bearing message into
        // one `role:"tool"` message per block (OpenAI has no equivalent of a
        // user turn embedding multiple tool results).
        for msg in req.messages {
            messages.extend(split_tool_results(msg));
        }

        Self {
            model: req.model,
            messages,
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            top_p: req.top_p,
            frequency_penalty: req.frequency_penalty,
            presence_penalty: req.presence_penalty,
            stop: req.stop_sequences,
            stream: req.stream,
            tools: req.tools.map(|t| t.into_iter().map(openai::Tool::from).collect()),
            tool_choice: req.tool_choice.map(openai::ToolChoice::from),
            parallel_tool_calls: req.parallel_tool_calls,
        }
    }
}

impl From<unified::UnifiedRole> for openai::ChatRole {
    fn from(role: unified::UnifiedRole) -> Self {
        match role {
            unified::UnifiedRole::System => openai::ChatRole::System,
            unified::UnifiedRole::User => openai::ChatRole::User,
            unified::UnifiedRole::Assistant => openai::ChatRole::Assistant,
            unified::UnifiedRole::Tool => openai::ChatRole::Tool,
        }
    }
}

/// Splits a unified message into the OpenAI messages it maps to.
///
/// A message whose content contains one or more `tool_result` blocks has no
/// single-message OpenAI shape: each block becomes its own `role:"tool"`
/// message carrying `tool_call_id: Some(tool_use_id)`, per the dialect's
/// one-tool-result-per-message convention. Any plain text sharing the block
/// list (there usually isn't any — a normalized history keeps a tool-result
/// turn to just its blocks) is emitted as a trailing message in the
/// original role. Everything else goes through the regular `From` impl
/// unchanged.
fn split_tool_results(msg: unified::UnifiedMessage) -> Vec<openai::ChatMessage> {
    let unified::UnifiedMessage {
        role,
        content,
        tool_calls,
        tool_call_id,
    } = msg;

    let blocks = match content {
        unified::UnifiedContentContainer::Blocks(blocks) if blocks.iter().any(unified::UnifiedContent::is_tool_result) => blocks,
        content => {
            return vec![openai::ChatMessage::from(unified::UnifiedMessage {
                role,
                content,
                tool_calls,
                tool_call_id,
            })];
        }
    };

    let mut out = Vec::with_capacity(blocks.len());
    let mut text_parts = Vec::new();

    for block in blocks {
        match block {
            unified::UnifiedContent::ToolResult {
                tool_use_id, content, ..
            } => out.push(openai::ChatMessage {
                role: openai::ChatRole::Tool,
                content: Some(match content {
                    unified::UnifiedToolResultContent::Text(text) => text,
                    unified::UnifiedToolResultContent::Multiple(texts) => texts.join("\n"),
                }),
                tool_calls: None,
                tool_call_id: Some(tool_use_id),
            }),
            unified::UnifiedContent::Text { text } => text_parts.push(text),
            _ => {}
        }
    }

    if !text_parts.is_empty() {
        out.push(openai::ChatMessage {
            role: openai::ChatRole::from(role),
            content: Some(text_parts.join("\n")),
            tool_calls: None,
            tool_call_id,
        });
    }

    out
}

impl From<unified::UnifiedMessage> for openai::ChatMessage {
    fn from(msg: unified::UnifiedMessage) -> Self {
        let role = openai::ChatRole::from(msg.role);

        let content = match msg.content {
            unified::UnifiedContentContainer::Text(text) => Some(text),
            unified::UnifiedContentContainer::Blocks(blocks) => {
                // Convert blocks to text - OpenAI doesn't support structured content in the same way.
                // `tool_result` blocks are handled by `split_tool_results` before a message ever
                // reaches here; this flattening only ever sees text (e.g. an assistant turn).
                let text_parts: Vec<String> = blocks
                    .into_iter()
                    .filter_map(|block| match block {
                        unified::UnifiedContent::Text { text } => Some(text),
                        _ => None,
                    })
                    .collect();

                if text_parts.is_empty() {
                    None
                } else {
                    Some(text_parts.join("\n"))
                }
            }
        };

        Self {
            role,
            content,
            tool_calls: msg.tool_calls.map(|calls| {
                calls
                    .into_iter()
                    .map(|call| openai::ToolCall {
                        id: call.id,
                        tool_type: openai::ToolCallType::Function,
                        function: openai::FunctionCall {
                            name: call.function.name,
                            arguments: match call.function.arguments {
                                unified::UnifiedArguments::String(s) => s,
                                unified::UnifiedArguments::Value(v) => {
                                    serde_json::to_string(&v).unwrap_or_else(|_| "{}".to_string())
                                }
                            },
                        },
                    })
                    .collect()
            }),
            tool_call_id: msg.tool_call_id,
        }
    }
}

impl From<unified::UnifiedTool> for openai::Tool {
    fn from(tool: unified::UnifiedTool) -> Self {
        Self {
            tool_type: openai::ToolCallType::Function,
            function: openai::FunctionDefinition {
                name: tool.function.name,
                description: tool.function.description,
                parameters: tool.function.parameters,
            },
        }
    }
}

impl From<unified::UnifiedToolChoiceMode> for openai::ToolChoiceMode {
    fn from(mode: unified::UnifiedToolChoiceMode) -> Self {
        match mode {
            unified::UnifiedToolChoiceMode::None => openai::ToolChoiceMode::None,
            unified::UnifiedToolChoiceMode::Auto => openai::ToolChoiceMode::Auto,
            unified::UnifiedToolChoiceMode::Required => openai::ToolChoiceMode::Required,
        }
    }
}

impl From<unified::UnifiedToolChoice> for openai::ToolChoice {
    fn from(choice: unified::UnifiedToolChoice) -> Self {
        match choice {
            unified::UnifiedToolChoice::Mode(mode) => openai::ToolChoice::Mode(openai::ToolChoiceMode::from(mode)),
            unified::UnifiedToolChoice::Specific { function } => openai::ToolChoice::Specific {
                tool_type: openai::ToolCallType::Function,
                function: openai::ToolChoiceFunction { name: function.name },
            },
        }
    }
}

impl From<unified::UnifiedResponse> for openai::ChatCompletionResponse {
    fn from(resp: unified::UnifiedResponse) -> Self {
        Self {
            id: resp.id,
            object: openai::ObjectType::ChatCompletion,
            created: resp.created,
            model: resp.model,
            choices: resp
                .choices
                .into_iter()
                .map(|choice| openai::ChatChoice {
                    index: choice.index,
                    message: openai::ChatMessage::from(choice.message),
                    finish_reason: choice
                        .finish_reason
                        .map(openai::FinishReason::from)
                        .unwrap_or(openai::FinishReason::Stop),
                })
                .collect(),
            usage: openai::Usage {
                prompt_tokens: resp.usage.prompt_tokens,
                completion_tokens: resp.usage.completion_tokens,
                total_tokens: resp.usage.total_tokens,
            },
        }
    }
}

impl From<unified::UnifiedFinishReason> for openai::FinishReason {
    fn from(reason: unified::UnifiedFinishReason) -> Self {
        match reason {
            unified::UnifiedFinishReason::Stop => openai::FinishReason::Stop,
            unified::UnifiedFinishReason::Length => openai::FinishReason::Length,
            unified::UnifiedFinishReason::ContentFilter => openai::FinishReason::ContentFilter,
            unified::UnifiedFinishReason::ToolCalls => openai::FinishReason::ToolCalls,
        }
    }
}

impl From<unified::UnifiedStreamingToolCall> for openai::StreamingToolCall {
    fn from(call: unified::UnifiedStreamingToolCall) -> Self {
        match call {
            unified::UnifiedStreamingToolCall::Start { index, id, function } => openai::StreamingToolCall::Start {
                index,
                id,
                r#type: openai::ToolCallType::Function,
                function: openai::FunctionStart {
                    name: function.name,
                    arguments: function.arguments,
                },
            },
            unified::UnifiedStreamingToolCall::Delta { index, function } => openai::StreamingToolCall::Delta {
                index,
                function: openai::FunctionDelta {
                    arguments: function.arguments,
                },
            },
        }
    }
}

impl From<unified::UnifiedChunk> for openai::ChatCompletionChunk {
    fn from(chunk: unified::UnifiedChunk) -> Self {
        Self {
            id: chunk.id.into_owned(),
            object: openai::ObjectType::ChatCompletionChunk,
            created: chunk.created,
            model: chunk.model.into_owned(),
            system_fingerprint: None,
            choices: chunk
                .choices
                .into_iter()
                .map(|choice| openai::ChatChoiceDelta {
                    index: choice.index,
                    logprobs: None,
                    delta: openai::ChatMessageDelta {
                        role: choice.delta.role.map(openai::ChatRole::from),
                        content: choice.delta.content,
                        function_call: None,
                        tool_calls: choice
                            .delta
                            .tool_calls
                            .map(|calls| calls.into_iter().map(openai::StreamingToolCall::from).collect()),
                    },
                    finish_reason: choice.finish_reason.map(openai::FinishReason::from),
                })
                .collect(),
            usage: chunk.usage.map(|u| openai::Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            }),
        }
    }
}

impl From<unified::UnifiedModel> for openai::Model {
    fn from(model: unified::UnifiedModel) -> Self {
        Self {
            id: model.id,
            object: openai::ObjectType::Model,
            created: model.created,
            owned_by: model.owned_by,
        }
    }
}

impl From<unified::UnifiedModelsResponse> for openai::ModelsResponse {
    fn from(response: unified::UnifiedModelsResponse) -> Self {
        Self {
            object: openai::ObjectType::List,
            data: response.models.into_iter().map(openai::Model::from).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::messages::{openai, unified};

    fn sample_request(messages: Vec<unified::UnifiedMessage>) -> unified::UnifiedRequest {
        unified::UnifiedRequest {
            model: "whatever".to_string(),
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

    #[test]
    fn tool_result_block_becomes_tool_role_message_with_call_id() {
        let user_msg = unified::UnifiedMessage {
            role: unified::UnifiedRole::User,
            content: unified::UnifiedContentContainer::Blocks(vec![unified::UnifiedContent::ToolResult {
                tool_use_id: "call_123".to_string(),
                content: unified::UnifiedToolResultContent::Text("abc".to_string()),
                is_error: None,
            }]),
            tool_calls: None,
            tool_call_id: None,
        };

        let req = openai::ChatCompletionRequest::from(sample_request(vec![user_msg]));

        assert_eq!(req.messages.len(), 1);
        let msg = &req.messages[0];
        assert_eq!(msg.role, openai::ChatRole::Tool);
        assert_eq!(msg.content.as_deref(), Some("abc"));
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_123"));
        assert!(msg.tool_calls.is_none());
    }

    #[test]
    fn multiple_tool_results_split_into_one_tool_message_each() {
        let user_msg = unified::UnifiedMessage {
            role: unified::UnifiedRole::User,
            content: unified::UnifiedContentContainer::Blocks(vec![
                unified::UnifiedContent::ToolResult {
                    tool_use_id: "call_1".to_string(),
                    content: unified::UnifiedToolResultContent::Text("one".to_string()),
                    is_error: None,
                },
                unified::UnifiedContent::ToolResult {
                    tool_use_id: "call_2".to_string(),
                    content: unified::UnifiedToolResultContent::Text("two".to_string()),
                    is_error: Some(true),
                },
            ]),
            tool_calls: None,
            tool_call_id: None,
        };

        let req = openai::ChatCompletionRequest::from(sample_request(vec![user_msg]));

        assert_eq!(req.messages.len(), 2);
        assert_eq!(req.messages[0].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(req.messages[0].content.as_deref(), Some("one"));
        assert_eq!(req.messages[1].tool_call_id.as_deref(), Some("call_2"));
        assert_eq!(req.messages[1].content.as_deref(), Some("two"));
        assert!(req.messages.iter().all(|m| m.role == openai::ChatRole::Tool));
    }

    #[test]
    fn plain_text_message_is_unaffected() {
        let user_msg = unified::UnifiedMessage {
            role: unified::UnifiedRole::User,
            content: unified::UnifiedContentContainer::Text("hello".to_string()),
            tool_calls: None,
            tool_call_id: None,
        };

        let req = openai::ChatCompletionRequest::from(sample_request(vec![user_msg]));

        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.messages[0].role, openai::ChatRole::User);
        assert_eq!(req.messages[0].content.as_deref(), Some("hello"));
        assert!(req.messages[0].tool_call_id.is_none());
    }
}
