//! Message-list normalization: invariants T1 (tool pairing) and T2 (role alternation).
//!
//! Dialect conversion (`from_anthropic`/`from_openai`) produces a `UnifiedRequest`
//! whose message list may still violate these invariants — a dropped client
//! message, a truncated history, or a hand-written test fixture can all leave
//! an orphaned `tool_use` or `tool_result` behind. This module is the single
//! place that repairs that before the history engine or router ever see it.

use super::unified::{UnifiedContent, UnifiedContentContainer, UnifiedMessage, UnifiedRequest, UnifiedRole};

/// What normalization changed, surfaced by the orchestrator as warning headers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizationReport {
    /// `tool_use` ids that had no matching `tool_result` and were dropped.
    pub dropped_tool_use_ids: Vec<String>,
    /// `tool_result` ids that answered no pending `tool_use` and were dropped.
    pub dropped_tool_result_ids: Vec<String>,
    /// Number of adjacent same-role messages merged into one.
    pub merged_messages: usize,
    /// Number of messages dropped entirely because their content went empty.
    pub dropped_empty_messages: usize,
}

impl NormalizationReport {
    /// Whether anything was actually changed; the orchestrator only emits a
    /// warning header when this is true.
    pub fn is_noop(&self) -> bool {
        self.dropped_tool_use_ids.is_empty()
            && self.dropped_tool_result_ids.is_empty()
            && self.merged_messages == 0
            && self.dropped_empty_messages == 0
    }
}

impl UnifiedRequest {
    /// Applies T1 and T2 normalization in place. `merge_consecutive` controls
    /// whether adjacent same-role messages are block-concatenated first
    /// (on by default per the dialect converter's mapping rules).
    pub fn normalize(&mut self, merge_consecutive: bool) -> NormalizationReport {
        let mut report = NormalizationReport::default();

        if merge_consecutive {
            report.merged_messages = merge_consecutive_same_role(&mut self.messages);
        }

        enforce_tool_pairing(&mut self.messages, &mut report);
        report.dropped_empty_messages = drop_empty_messages(&mut self.messages);

        report
    }

    /// T2's last clause: the normalized history must end on a `user` turn.
    /// Outside of continuation this is a 422 if false; the continuation
    /// controller is the only caller allowed to paper over it.
    pub fn ends_with_user(&self) -> bool {
        matches!(self.messages.last().map(|m| &m.role), Some(UnifiedRole::User))
    }
}

fn content_blocks(container: UnifiedContentContainer) -> Vec<UnifiedContent> {
    match container {
        UnifiedContentContainer::Text(text) => {
            if text.is_empty() {
                Vec::new()
            } else {
                vec![UnifiedContent::Text { text }]
            }
        }
        UnifiedContentContainer::Blocks(blocks) => blocks,
    }
}

/// Merges runs of consecutive messages sharing a role by block-concatenation.
/// Returns the number of messages removed by merging.
fn merge_consecutive_same_role(messages: &mut Vec<UnifiedMessage>) -> usize {
    if messages.len() < 2 {
        return 0;
    }

    let before = messages.len();
    let mut merged: Vec<UnifiedMessage> = Vec::with_capacity(messages.len());

    for message in messages.drain(..) {
        match merged.last_mut() {
            Some(prev) if prev.role == message.role => {
                let mut blocks = content_blocks(std::mem::replace(&mut prev.content, UnifiedContentContainer::Text(String::new())));
                blocks.extend(content_blocks(message.content));
                prev.content = UnifiedContentContainer::Blocks(blocks);

                if let Some(extra) = message.tool_calls {
                    prev.tool_calls.get_or_insert_with(Vec::new).extend(extra);
                }
            }
            _ => merged.push(message),
        }
    }

    *messages = merged;
    before - messages.len()
}

/// T1: every assistant `tool_use` id must be answered by exactly one
/// `tool_result` with the same id in the immediately following message.
/// Unmatched blocks on either side are dropped rather than synthesized —
/// inventing a fake tool result would be a worse lie than a visible gap.
fn enforce_tool_pairing(messages: &mut [UnifiedMessage], report: &mut NormalizationReport) {
    for i in 0..messages.len() {
        if messages[i].role != UnifiedRole::Assistant {
            continue;
        }

        let pending_ids: Vec<String> = match &messages[i].content {
            UnifiedContentContainer::Blocks(blocks) => blocks
                .iter()
                .filter(|b| b.is_tool_use())
                .filter_map(|b| b.tool_id().map(str::to_owned))
                .collect(),
            _ => Vec::new(),
        };

        if pending_ids.is_empty() {
            continue;
        }

        let answered: std::collections::HashSet<String> = match messages.get(i + 1).map(|m| &m.content) {
            Some(UnifiedContentContainer::Blocks(blocks)) => blocks
                .iter()
                .filter(|b| b.is_tool_result())
                .filter_map(|b| b.tool_id().map(str::to_owned))
                .collect(),
            _ => Default::default(),
        };

        for id in &pending_ids {
            if !answered.contains(id) {
                report.dropped_tool_use_ids.push(id.clone());
            }
        }

        if let UnifiedContentContainer::Blocks(blocks) = &mut messages[i].content {
            blocks.retain(|b| !b.is_tool_use() || answered.contains(b.tool_id().unwrap_or_default()));
        }
        if let Some(calls) = &mut messages[i].tool_calls {
            calls.retain(|c| answered.contains(&c.id));
        }

        if let Some(next) = messages.get_mut(i + 1) {
            if let UnifiedContentContainer::Blocks(blocks) = &mut next.content {
                blocks.retain(|b| {
                    if !b.is_tool_result() {
                        return true;
                    }
                    let id = b.tool_id().unwrap_or_default();
                    let keep = pending_ids.iter().any(|p| p == id);
                    if !keep {
                        report.dropped_tool_result_ids.push(id.to_string());
                    }
                    keep
                });
            }
        }
    }
}

fn is_message_empty(message: &UnifiedMessage) -> bool {
    match &message.content {
        UnifiedContentContainer::Text(text) => text.is_empty(),
        UnifiedContentContainer::Blocks(blocks) => blocks.is_empty(),
    }
}

fn drop_empty_messages(messages: &mut Vec<UnifiedMessage>) -> usize {
    let before = messages.len();
    messages.retain(|m| !is_message_empty(m));
    before - messages.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::unified::{UnifiedContent, UnifiedContentContainer, UnifiedMessage, UnifiedRequest, UnifiedRole};
    use serde_json::json;

    fn text_message(role: UnifiedRole, text: &str) -> UnifiedMessage {
        UnifiedMessage {
            role,
            content: UnifiedContentContainer::Text(text.to_string()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    fn base_request(messages: Vec<UnifiedMessage>) -> UnifiedRequest {
        UnifiedRequest {
            model: "test".to_string(),
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
    fn merges_consecutive_same_role_messages() {
        let mut request = base_request(vec![
            text_message(UnifiedRole::User, "hello"),
            text_message(UnifiedRole::User, "are you there"),
            text_message(UnifiedRole::Assistant, "yes"),
        ]);

        let report = request.normalize(true);

        assert_eq!(report.merged_messages, 1);
        assert_eq!(request.messages.len(), 2);
        match &request.messages[0].content {
            UnifiedContentContainer::Blocks(blocks) => assert_eq!(blocks.len(), 2),
            _ => panic!("expected merged blocks"),
        }
    }

    #[test]
    fn drops_unanswered_tool_use_and_orphaned_tool_result() {
        let assistant = UnifiedMessage {
            role: UnifiedRole::Assistant,
            content: UnifiedContentContainer::Blocks(vec![UnifiedContent::ToolUse {
                id: "t1".to_string(),
                name: "Read".to_string(),
                input: json!({"path": "/tmp/x"}),
            }]),
            tool_calls: None,
            tool_call_id: None,
        };

        let user_reply = UnifiedMessage {
            role: UnifiedRole::User,
            content: UnifiedContentContainer::Blocks(vec![UnifiedContent::ToolResult {
                tool_use_id: "t2-does-not-exist".to_string(),
                content: super::super::unified::UnifiedToolResultContent::Text("abc".to_string()),
                is_error: None,
            }]),
            tool_calls: None,
            tool_call_id: None,
        };

        let mut request = base_request(vec![text_message(UnifiedRole::User, "read file"), assistant, user_reply]);
        let report = request.normalize(false);

        assert_eq!(report.dropped_tool_use_ids, vec!["t1".to_string()]);
        assert_eq!(report.dropped_tool_result_ids, vec!["t2-does-not-exist".to_string()]);
        // Both content-bearing blocks were dropped, so both messages go empty and are removed.
        assert_eq!(request.messages.len(), 1);
    }

    #[test]
    fn keeps_properly_paired_tool_blocks() {
        let assistant = UnifiedMessage {
            role: UnifiedRole::Assistant,
            content: UnifiedContentContainer::Blocks(vec![UnifiedContent::ToolUse {
                id: "t1".to_string(),
                name: "Read".to_string(),
                input: json!({"path": "/tmp/x"}),
            }]),
            tool_calls: None,
            tool_call_id: None,
        };

        let user_reply = UnifiedMessage {
            role: UnifiedRole::User,
            content: UnifiedContentContainer::Blocks(vec![UnifiedContent::ToolResult {
                tool_use_id: "t1".to_string(),
                content: super::super::unified::UnifiedToolResultContent::Text("abc".to_string()),
                is_error: None,
            }]),
            tool_calls: None,
            tool_call_id: None,
        };

        let mut request = base_request(vec![assistant, user_reply]);
        let report = request.normalize(false);

        assert!(report.dropped_tool_use_ids.is_empty());
        assert!(report.dropped_tool_result_ids.is_empty());
        assert_eq!(request.messages.len(), 2);
    }
}
