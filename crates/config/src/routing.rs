//! Model router configuration (C5).

use serde::Deserialize;

/// Priority-ordered model routing policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelRoutingConfig {
    /// Whether the heuristic router runs at all. When disabled every request
    /// is routed to `opus_model`.
    pub enabled: bool,
    /// Header name consulted for the whitelist rule (priority 0).
    pub whitelist_header: String,
    /// In-message marker consulted for the whitelist rule (priority 0).
    pub whitelist_marker: String,
    /// Maximum number of user messages for a history to count as "first turn".
    pub first_turn_max_user_messages: usize,
    /// Probability (0.0-1.0) of routing a first-turn request to Opus.
    pub first_turn_opus_probability: f64,
    /// Substrings that force the Opus tier when present in any message (priority 2).
    pub force_opus_keywords: Vec<String>,
    /// Substrings that force the Sonnet tier when present in any message (priority 3).
    pub force_sonnet_keywords: Vec<String>,
    /// Tool-call count in the history at or above which the execution-phase rule fires.
    pub execution_phase_tool_calls: usize,
    /// Probability (0.0-1.0) of routing an execution-phase request to Sonnet.
    pub execution_phase_sonnet_probability: f64,
    /// Baseline probability (0.0-1.0) of routing to Opus absent any other signal.
    pub base_opus_probability: f64,
}

impl Default for ModelRoutingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            whitelist_header: "X-Force-Model".to_string(),
            whitelist_marker: "[FORCE_OPUS]".to_string(),
            first_turn_max_user_messages: 1,
            first_turn_opus_probability: 0.7,
            force_opus_keywords: Vec::new(),
            force_sonnet_keywords: Vec::new(),
            execution_phase_tool_calls: 3,
            execution_phase_sonnet_probability: 0.8,
            base_opus_probability: 0.3,
        }
    }
}
