//! OpenAI chat-completions wire format.
//!
//! Mirrors the request/response shapes documented at
//! <https://platform.openai.com/docs/api-reference/chat>, trimmed to the
//! fields this proxy actually forwards or understands.

use serde::{Deserialize, Serialize};

/// JSON Schema blob for tool parameters. Passed through opaquely.
pub type JsonSchema = serde_json::Value;

/// Request body for the chat completions endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatCompletionRequest {
    /// Model identifier.
    pub model: String,

    /// Conversation so far, oldest first.
    pub messages: Vec<ChatMessage>,

    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Maximum tokens to generate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Nucleus sampling parameter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    /// Penalize tokens by their frequency in the text so far.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,

    /// Penalize tokens that have appeared at all so far.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,

    /// Sequences that stop generation when encountered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,

    /// Whether to stream the response as SSE chunks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,

    /// Tools the model may call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,

    /// Controls whether and how the model calls tools.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,

    /// Whether multiple tool calls may be emitted in one turn.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel_tool_calls: Option<bool>,
}

/// Role of a chat-completions message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    /// System instructions.
    System,
    /// End-user turn.
    User,
    /// Model turn.
    Assistant,
    /// Tool execution result.
    Tool,
}

/// A single chat-completions message.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatMessage {
    /// Who sent this message.
    pub role: ChatRole,

    /// Flattened text content, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// Tool calls requested by the assistant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,

    /// The tool_call_id this message answers, for role `tool`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

/// A tool made available to the model.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Tool {
    /// Always `function` today; kept for forward compatibility.
    #[serde(rename = "type")]
    pub tool_type: ToolCallType,

    /// The callable function definition.
    pub function: FunctionDefinition,
}

/// Discriminator for tool call kinds. OpenAI only defines `function`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallType {
    /// A callable function.
    Function,
}

/// Function schema advertised to the model.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FunctionDefinition {
    /// Function name, referenced by tool calls.
    pub name: String,

    /// Human-readable description of what the function does.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// JSON Schema describing accepted arguments.
    pub parameters: Box<JsonSchema>,
}

/// How the model should use the available tools.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ToolChoice {
    /// One of the named modes.
    Mode(ToolChoiceMode),
    /// Force a specific named function.
    Specific {
        /// Always `function`.
        #[serde(rename = "type")]
        tool_type: ToolCallType,
        /// The function to force.
        function: ToolChoiceFunction,
    },
}

/// Named tool choice mode.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoiceMode {
    /// No tool may be called.
    None,
    /// The model decides.
    Auto,
    /// At least one tool call is required.
    Required,
}

/// Function name used to force a specific tool.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolChoiceFunction {
    /// The forced function's name.
    pub name: String,
}

/// A tool call requested by the assistant.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolCall {
    /// Unique identifier correlating this call with its result.
    pub id: String,

    /// Always `function`.
    #[serde(rename = "type")]
    pub tool_type: ToolCallType,

    /// The function being called.
    pub function: FunctionCall,
}

/// Function name and arguments for a tool call.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FunctionCall {
    /// Function name.
    pub name: String,

    /// Arguments, as a JSON-encoded string (not a parsed value).
    pub arguments: String,
}

/// Response body for a non-streaming chat completion.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatCompletionResponse {
    /// Unique identifier for this completion.
    pub id: String,

    /// Always `chat.completion`.
    pub object: ObjectType,

    /// Unix timestamp of creation.
    pub created: u64,

    /// Model that produced the response.
    pub model: String,

    /// Completion choices. The proxy only ever requests and returns one.
    pub choices: Vec<ChatChoice>,

    /// Token accounting for the request/response pair.
    pub usage: Usage,
}

/// Discriminator for OpenAI object kinds used in this module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum ObjectType {
    /// A model descriptor.
    #[serde(rename = "model")]
    Model,
    /// A list response.
    #[serde(rename = "list")]
    List,
    /// A non-streaming chat completion.
    #[serde(rename = "chat.completion")]
    ChatCompletion,
    /// A streaming chat completion chunk.
    #[serde(rename = "chat.completion.chunk")]
    ChatCompletionChunk,
}

/// A single completion choice.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatChoice {
    /// Index of this choice among the response's choices.
    pub index: u32,

    /// The generated message.
    pub message: ChatMessage,

    /// Why generation stopped.
    pub finish_reason: FinishReason,
}

/// Token usage for a request/response pair.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
pub struct Usage {
    /// Tokens in the prompt.
    pub prompt_tokens: u32,
    /// Tokens in the completion.
    pub completion_tokens: u32,
    /// Sum of prompt and completion tokens.
    pub total_tokens: u32,
}

/// Why the model stopped generating.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural stop.
    Stop,
    /// Hit the token limit.
    Length,
    /// Stopped by content filtering.
    ContentFilter,
    /// Stopped to emit tool calls.
    ToolCalls,
}

/// A model descriptor, as returned by the models-list endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Model {
    /// Model identifier, used as the `model` field in requests.
    pub id: String,
    /// Always `model`.
    pub object: ObjectType,
    /// Unix timestamp of creation/registration.
    pub created: u64,
    /// Organization that owns the model.
    pub owned_by: String,
}

/// Response body for the models-list endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelsResponse {
    /// Always `list`.
    pub object: ObjectType,
    /// The available models.
    pub data: Vec<Model>,
}

/// A single SSE chunk of a streaming chat completion.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatCompletionChunk {
    /// Identifier shared across all chunks of one completion.
    pub id: String,
    /// Always `chat.completion.chunk`.
    pub object: ObjectType,
    /// Unix timestamp of creation.
    pub created: u64,
    /// Model that produced the response.
    pub model: String,
    /// Backend fingerprint, passed through when upstream provides one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_fingerprint: Option<String>,
    /// Delta choices for this chunk.
    pub choices: Vec<ChatChoiceDelta>,
    /// Usage, populated only on the final chunk when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// A single choice's delta within a streaming chunk.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatChoiceDelta {
    /// Index of this choice among the response's choices.
    pub index: u32,
    /// Log-probability data; never populated by this proxy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logprobs: Option<serde_json::Value>,
    /// The incremental content for this chunk.
    pub delta: ChatMessageDelta,
    /// Present only on the chunk that ends the stream.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
}

/// Incremental content for one streaming chunk.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ChatMessageDelta {
    /// Present only on the first chunk of a message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<ChatRole>,
    /// Incremental text, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Legacy function-call delta, never emitted by this proxy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_call: Option<serde_json::Value>,
    /// Incremental tool call fragments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<StreamingToolCall>>,
}

/// A fragment of a tool call as it streams in.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum StreamingToolCall {
    /// First fragment: carries the id, type, and function name.
    Start {
        /// Position of this tool call among the message's tool calls.
        index: usize,
        /// Unique identifier correlating this call with its result.
        id: String,
        /// Always `function`.
        r#type: ToolCallType,
        /// Name and (possibly partial) arguments.
        function: FunctionStart,
    },
    /// Subsequent fragment: carries only incremental argument text.
    Delta {
        /// Position of this tool call among the message's tool calls.
        index: usize,
        /// Incremental argument text.
        function: FunctionDelta,
    },
}

/// Function name and initial argument fragment for a streaming tool call.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FunctionStart {
    /// Function name.
    pub name: String,
    /// Argument text accumulated so far (often empty on the first fragment).
    #[serde(default)]
    pub arguments: String,
}

/// Incremental argument text for a streaming tool call.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FunctionDelta {
    /// Argument text to append.
    pub arguments: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserialize_basic_request() {
        let json = json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "hi there"}],
            "stream": false,
        });

        let request: ChatCompletionRequest = serde_json::from_value(json).unwrap();
        assert_eq!(request.model, "gpt-4");
        assert_eq!(request.messages[0].role, ChatRole::User);
        assert_eq!(request.messages[0].content.as_deref(), Some("hi there"));
    }

    #[test]
    fn tool_choice_accepts_mode_or_specific() {
        let mode: ToolChoice = serde_json::from_value(json!("auto")).unwrap();
        assert!(matches!(mode, ToolChoice::Mode(ToolChoiceMode::Auto)));

        let specific: ToolChoice = serde_json::from_value(json!({
            "type": "function",
            "function": {"name": "get_weather"}
        }))
        .unwrap();
        let ToolChoice::Specific { function, .. } = specific else {
            unreachable!("expected specific tool choice");
        };
        assert_eq!(function.name, "get_weather");
    }

    #[test]
    fn streaming_tool_call_start_then_delta() {
        let start: StreamingToolCall = serde_json::from_value(json!({
            "index": 0,
            "id": "call_1",
            "type": "function",
            "function": {"name": "get_weather", "arguments": ""}
        }))
        .unwrap();
        assert!(matches!(start, StreamingToolCall::Start { .. }));

        let delta: StreamingToolCall = serde_json::from_value(json!({
            "index": 0,
            "function": {"arguments": "{\"city\":"}
        }))
        .unwrap();
        assert!(matches!(delta, StreamingToolCall::Delta { .. }));
    }

    #[test]
    fn serialize_chunk_omits_absent_usage() {
        let chunk = ChatCompletionChunk {
            id: "chatcmpl-1".to_string(),
            object: ObjectType::ChatCompletionChunk,
            created: 0,
            model: "gpt-4".to_string(),
            system_fingerprint: None,
            choices: vec![ChatChoiceDelta {
                index: 0,
                logprobs: None,
                delta: ChatMessageDelta {
                    role: Some(ChatRole::Assistant),
                    content: Some("hi".to_string()),
                    function_call: None,
                    tool_calls: None,
                },
                finish_reason: None,
            }],
            usage: None,
        };

        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["object"], "chat.completion.chunk");
        assert!(json.get("usage").is_none());
    }
}
