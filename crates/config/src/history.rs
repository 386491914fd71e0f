//! History management engine configuration (C3).

use serde::Deserialize;

/// Configuration for the multi-strategy history-shaping pipeline.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HistoryConfig {
    /// Enables the PRE_ESTIMATE strategy.
    pub pre_estimate_enabled: bool,
    /// Enables the AUTO_TRUNCATE strategy.
    pub auto_truncate_enabled: bool,
    /// Enables the SMART_SUMMARY strategy.
    pub smart_summary_enabled: bool,
    /// Enables the ERROR_RETRY strategy.
    pub error_retry_enabled: bool,

    /// Character count above which PRE_ESTIMATE kicks in.
    pub estimate_threshold: usize,
    /// Maximum number of messages AUTO_TRUNCATE will retain.
    pub max_messages: usize,
    /// Maximum total character budget AUTO_TRUNCATE will enforce.
    pub max_chars: usize,
    /// Character count above which SMART_SUMMARY considers summarizing.
    pub summary_threshold: usize,
    /// Number of most-recent messages SMART_SUMMARY always keeps verbatim.
    pub summary_keep_recent: usize,
    /// Message budget ERROR_RETRY shrinks toward.
    pub retry_max_messages: usize,
    /// Maximum number of ERROR_RETRY attempts per request.
    pub max_retries: u32,
    /// Approximate characters per token used when upstream usage is absent.
    pub chars_per_token: f64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            pre_estimate_enabled: true,
            auto_truncate_enabled: true,
            smart_summary_enabled: true,
            error_retry_enabled: true,

            estimate_threshold: 100_000,
            max_messages: 100,
            max_chars: 120_000,
            summary_threshold: 80_000,
            summary_keep_recent: 8,
            retry_max_messages: 20,
            max_retries: 3,
            chars_per_token: 3.0,
        }
    }
}
