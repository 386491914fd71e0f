//! Character-based token estimation.
//!
//! No tokenizer ships with this crate; upstream usage numbers are trusted
//! whenever they're available; this heuristic exists for the history
//! engine's pre-flight sizing decisions and the `count_tokens` endpoint,
//! where an approximation is good enough.

use crate::messages::unified::{UnifiedContent, UnifiedContentContainer, UnifiedMessage, UnifiedRequest, UnifiedToolResultContent};

/// CJK characters tend to each be close to their own token, so they're
/// counted far more expensively than the configurable Latin-text average.
const CJK_CHARS_PER_TOKEN: f64 = 1.5;

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x4E00..=0x9FFF     // CJK Unified Ideographs
        | 0x3040..=0x30FF   // Hiragana + Katakana
        | 0xAC00..=0xD7AF   // Hangul syllables
    )
}

/// Estimates a token count for a single string, splitting out CJK text
/// since it doesn't compress the way Latin scripts do. `chars_per_token`
/// governs the non-CJK half of the estimate and comes from
/// [`config::HistoryConfig::chars_per_token`].
pub fn estimate_text_tokens(text: &str, chars_per_token: f64) -> u32 {
    let (cjk_chars, other_chars) = text.chars().fold((0usize, 0usize), |(cjk, other), c| {
        if is_cjk(c) { (cjk + 1, other) } else { (cjk, other + 1) }
    });

    let tokens = (cjk_chars as f64 / CJK_CHARS_PER_TOKEN) + (other_chars as f64 / chars_per_token);
    tokens.ceil() as u32
}

fn message_text(message: &UnifiedMessage) -> String {
    match &message.content {
        UnifiedContentContainer::Text(text) => text.clone(),
        UnifiedContentContainer::Blocks(blocks) => blocks
            .iter()
            .map(|block| match block {
                UnifiedContent::Text { text } => text.clone(),
                UnifiedContent::ToolUse { name, input, .. } => format!("{name} {input}"),
                UnifiedContent::ToolResult { content, .. } => match content {
                    UnifiedToolResultContent::Text(text) => text.clone(),
                    UnifiedToolResultContent::Multiple(parts) => parts.join("\n"),
                },
                UnifiedContent::Thinking { text } => text.clone(),
                UnifiedContent::Image { .. } => String::new(),
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

/// Estimates the total input-token count for a request: system prompt plus
/// every message's rendered text.
pub fn estimate_request_tokens(request: &UnifiedRequest, chars_per_token: f64) -> u32 {
    let mut total = 0u32;

    if let Some(system) = &request.system {
        total += estimate_text_tokens(system, chars_per_token);
    }

    for message in &request.messages {
        total += estimate_text_tokens(&message_text(message), chars_per_token);
    }

    total
}

/// Total character count across a request's system prompt and message
/// text, used by the history engine's char-budget thresholds (cheaper
/// than the token estimate and good enough for a size gate).
pub fn estimate_request_chars(request: &UnifiedRequest) -> usize {
    let system_chars = request.system.as_deref().map(str::len).unwrap_or(0);
    let message_chars: usize = request.messages.iter().map(|m| message_text(m).len()).sum();
    system_chars + message_chars
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimates_ascii_text_at_the_configured_chars_per_token() {
        let tokens = estimate_text_tokens(&"a".repeat(40), 4.0);
        assert_eq!(tokens, 10);
    }

    #[test]
    fn lower_chars_per_token_yields_more_tokens_for_the_same_text() {
        let generous = estimate_text_tokens(&"a".repeat(40), 4.0);
        let conservative = estimate_text_tokens(&"a".repeat(40), 3.0);
        assert!(conservative > generous);
    }

    #[test]
    fn cjk_text_costs_more_tokens_per_character() {
        let cjk_tokens = estimate_text_tokens(&"字".repeat(40), 3.0);
        let ascii_tokens = estimate_text_tokens(&"a".repeat(40), 3.0);
        assert!(cjk_tokens > ascii_tokens);
    }

    #[test]
    fn empty_text_has_zero_tokens() {
        assert_eq!(estimate_text_tokens("", 3.0), 0);
    }
}
