//! Summary cache and background-summarization configuration (C4).

use serde::Deserialize;

/// Delta-triggered, TTL-bounded summary cache configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SummaryCacheConfig {
    /// Whether the summary cache is consulted and written to at all.
    pub enabled: bool,
    /// Minimum growth in message count since the cached entry to justify a refresh.
    pub min_delta_messages: usize,
    /// Minimum growth in character count since the cached entry to justify a refresh.
    pub min_delta_chars: usize,
    /// Maximum age of a cache entry, in seconds, before it is considered stale.
    pub max_age_secs: u64,
    /// Maximum number of distinct session keys held in the cache (LRU-evicted).
    pub max_entries: usize,
}

impl Default for SummaryCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_delta_messages: 4,
            min_delta_chars: 4_000,
            max_age_secs: 30 * 60,
            max_entries: 10_000,
        }
    }
}

/// Async / fast-first summarization configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AsyncSummaryConfig {
    /// Whether background summarization is allowed at all.
    pub enabled: bool,
    /// On a cache miss, return a plain truncation immediately and refresh in the background.
    pub fast_first_request: bool,
    /// Maximum number of background summarization tasks allowed in flight.
    pub max_pending_tasks: usize,
    /// Message-count delta that triggers a background refresh even on a cache hit.
    pub update_interval_messages: usize,
    /// Time budget for a background summarization task before it is abandoned, in seconds.
    pub task_timeout_secs: u64,
}

impl Default for AsyncSummaryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fast_first_request: true,
            max_pending_tasks: 64,
            update_interval_messages: 10,
            task_timeout_secs: 30,
        }
    }
}
