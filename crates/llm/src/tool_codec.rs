//! Inline tool-call codec for models that don't speak native tool-calling.
//!
//! Some upstream models never emit a structured `tool_calls` delta; instead
//! they write the call out as plain assistant text, e.g.
//! `[Calling tool: get_weather] Input: {"location": "Paris"}`. This module
//! renders native [`UnifiedContent::ToolUse`] blocks into that textual form
//! for such a model, and tolerantly parses it back out of streamed or
//! completed text when a model chose to answer that way.

use config::ToolsConfig;

use crate::messages::unified::{UnifiedContent, UnifiedContentContainer, UnifiedResponse, UnifiedToolCall};

const CALL_MARKER_PREFIX: &str = "[Calling tool: ";
const INPUT_MARKER: &str = "] Input: ";

/// Renders a single tool call as the inline marker text a legacy model
/// would be prompted to imitate.
pub(crate) fn render_inline(name: &str, input: &serde_json::Value) -> String {
    let input_json = sonic_rs::to_string(input).unwrap_or_else(|_| "{}".to_string());
    format!("{CALL_MARKER_PREFIX}{name}{INPUT_MARKER}{input_json}")
}

/// Renders every tool call a message carries as one string, one call per
/// line, for providers that only accept plain assistant text.
pub(crate) fn render_structured(tool_calls: &[UnifiedToolCall]) -> String {
    tool_calls
        .iter()
        .map(|call| {
            let input = serde_json::Value::from(call.function.arguments.clone());
            render_inline(&call.function.name, &input)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// A tool call extracted from inline text, plus the byte range it occupied
/// in the source string so callers can splice it out.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ExtractedCall {
    pub name: String,
    pub input: serde_json::Value,
    pub span: std::ops::Range<usize>,
}

/// Result of scanning a block of text for inline tool-call markers.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct ExtractResult {
    /// Text with every recognized call marker removed.
    pub remaining_text: String,
    /// Calls successfully parsed out, in source order.
    pub calls: Vec<ExtractedCall>,
}

/// Scans `text` for `[Calling tool: <name>] Input: <json>` markers and
/// tolerantly extracts them.
///
/// The JSON object's extent is found by depth-tracking braces rather than
/// trusting the model to terminate the line cleanly: the model may wrap
/// the call in trailing prose, omit a closing newline, or otherwise hand
/// back text a naive `split('\n')` would mangle. A call whose JSON fails to
/// parse is retried once after a light sanitization pass (stripping
/// control characters and trailing commas before the closing brace); if
/// that also fails the marker is left untouched in `remaining_text` and a
/// warning is logged, rather than silently dropping content.
pub(crate) fn extract_blocks(text: &str, config: &ToolsConfig) -> ExtractResult {
    if !config.native_tools_fallback_enabled {
        return ExtractResult {
            remaining_text: text.to_string(),
            calls: Vec::new(),
        };
    }

    let mut calls = Vec::new();
    let mut cursor = 0usize;
    let mut kept = String::with_capacity(text.len());

    while let Some(marker_offset) = text[cursor..].find(CALL_MARKER_PREFIX) {
        let marker_start = cursor + marker_offset;
        kept.push_str(&text[cursor..marker_start]);

        let Some(parsed) = parse_one_call(text, marker_start) else {
            // Not a well-formed marker after all; keep the literal text and
            // resume scanning just past the prefix so we don't loop forever.
            kept.push_str(CALL_MARKER_PREFIX);
            cursor = marker_start + CALL_MARKER_PREFIX.len();
            continue;
        };

        calls.push(ExtractedCall {
            name: parsed.name,
            input: parsed.input,
            span: marker_start..parsed.end,
        });
        cursor = parsed.end;
    }

    kept.push_str(&text[cursor..]);

    ExtractResult {
        remaining_text: kept,
        calls,
    }
}

struct ParsedCall {
    name: String,
    input: serde_json::Value,
    end: usize,
}

fn parse_one_call(text: &str, marker_start: usize) -> Option<ParsedCall> {
    let after_prefix = marker_start + CALL_MARKER_PREFIX.len();
    let name_end = after_prefix + text[after_prefix..].find(INPUT_MARKER)?;
    let name = text[after_prefix..name_end].trim().to_string();
    if name.is_empty() {
        return None;
    }

    let json_start = name_end + INPUT_MARKER.len();
    let brace_start = json_start + text[json_start..].find('{')?;
    // anything between the marker and the first brace must be whitespace;
    // otherwise this isn't the JSON object we're looking for.
    if !text[json_start..brace_start].trim().is_empty() {
        return None;
    }

    let json_end = scan_json_object(&text[brace_start..])? + brace_start;
    let raw = &text[brace_start..json_end];

    let input = sonic_rs::from_str::<serde_json::Value>(raw)
        .ok()
        .or_else(|| sonic_rs::from_str::<serde_json::Value>(&sanitize(raw)).ok())?;

    Some(ParsedCall {
        name,
        input,
        end: json_end,
    })
}

/// Returns the index one past the matching closing brace for the object
/// starting at byte 0 of `text`, tracking quoted-string state so braces
/// inside string literals don't throw off the depth count.
fn scan_json_object(text: &str) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, ch) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(idx + ch.len_utf8());
                }
            }
            _ => {}
        }
    }

    None
}

/// Strips control characters and a trailing comma before the final brace,
/// the two malformations model output most commonly introduces.
fn sanitize(raw: &str) -> String {
    let cleaned: String = raw.chars().filter(|c| !c.is_control() || *c == '\n').collect();
    let trimmed = cleaned.trim_end();
    if let Some(body) = trimmed.strip_suffix('}') {
        let body = body.trim_end();
        if let Some(body) = body.strip_suffix(',') {
            return format!("{body}}}");
        }
    }
    cleaned
}

/// Truncates every tool spec's top-level description to `tool_desc_max_chars`
/// and every `description` field nested inside its JSON-schema parameters to
/// `tool_param_desc_max_chars`, so a handful of verbose tool specs can't
/// dominate a request's context budget before the history engine ever sees it.
pub(crate) fn apply_description_limits(tools: &mut [crate::messages::unified::UnifiedTool], config: &ToolsConfig) {
    for tool in tools {
        truncate_chars(&mut tool.function.description, config.tool_desc_max_chars);
        truncate_schema_descriptions(&mut tool.function.parameters, config.tool_param_desc_max_chars);
    }
}

fn truncate_chars(text: &mut String, max_chars: usize) {
    if text.chars().count() > max_chars {
        *text = text.chars().take(max_chars).collect();
    }
}

fn truncate_schema_descriptions(schema: &mut serde_json::Value, max_chars: usize) {
    match schema {
        serde_json::Value::Object(map) => {
            if let Some(serde_json::Value::String(desc)) = map.get_mut("description") {
                truncate_chars(desc, max_chars);
            }
            for (key, value) in map.iter_mut() {
                if key != "description" {
                    truncate_schema_descriptions(value, max_chars);
                }
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                truncate_schema_descriptions(item, max_chars);
            }
        }
        _ => {}
    }
}

/// Converts the native tool-use blocks of a message into the flattened
/// text a legacy-mode provider expects to see, appended after any plain
/// text already in the message.
pub(crate) fn flatten_tool_use_blocks(blocks: &[UnifiedContent]) -> String {
    let mut rendered = Vec::new();
    for block in blocks {
        if let UnifiedContent::ToolUse { name, input, .. } = block {
            rendered.push(render_inline(name, input));
        }
    }
    rendered.join("\n")
}

/// Applies inline-marker extraction to a non-streaming response's choices,
/// the batched-response counterpart to [`crate::streaming::AnthropicReemitter`]'s
/// per-chunk scan. A choice is scanned only when it carries no structured
/// tool calls already — once the upstream has answered natively, inline
/// marker text in the same message is left as plain text rather than
/// risking a duplicate invocation of the same call.
pub(crate) fn apply_legacy_extraction(response: &mut UnifiedResponse, config: &ToolsConfig) {
    for choice in &mut response.choices {
        if choice.message.tool_calls.as_ref().is_some_and(|calls| !calls.is_empty()) {
            continue;
        }

        let text = match &choice.message.content {
            UnifiedContentContainer::Text(text) => text.clone(),
            UnifiedContentContainer::Blocks(_) => continue,
        };
        if !text.contains(CALL_MARKER_PREFIX) {
            continue;
        }

        let result = extract_blocks(&text, config);
        if result.calls.is_empty() {
            continue;
        }

        let mut blocks = Vec::new();
        if !result.remaining_text.trim().is_empty() {
            blocks.push(UnifiedContent::Text {
                text: result.remaining_text,
            });
        }
        for (i, call) in result.calls.into_iter().enumerate() {
            blocks.push(UnifiedContent::ToolUse {
                id: format!("toolu_{i}"),
                name: call.name,
                input: call.input,
            });
        }
        choice.message.content = UnifiedContentContainer::Blocks(blocks);
    }
}
