//! Session-keyed cache of conversation summaries.
//!
//! The history engine (C3) consults this before calling out to a model to
//! re-summarize a conversation's older turns. A write is accepted only when
//! the conversation has moved meaningfully since the last cached summary,
//! so that a burst of small follow-up turns doesn't force a fresh
//! summarization call on every single request.

use std::sync::Arc;
use std::time::Duration;

use config::SummaryCacheConfig;
use dashmap::DashSet;
use mini_moka::sync::Cache;

/// A cached summary and the conversation shape it was computed against.
#[derive(Debug, Clone)]
pub(crate) struct SummaryEntry {
    pub text: String,
    pub message_count: usize,
    pub char_count: usize,
}

pub(crate) struct SummaryCache {
    entries: Cache<String, Arc<SummaryEntry>>,
    /// Session keys with a background refresh task currently in flight, so
    /// concurrent requests for the same session don't all kick off their
    /// own re-summarization call.
    in_flight: DashSet<String>,
}

impl SummaryCache {
    pub fn new(config: &SummaryCacheConfig) -> Self {
        let entries = Cache::builder()
            .max_capacity(config.max_entries as u64)
            .time_to_live(Duration::from_secs(config.max_age_secs))
            .build();

        Self {
            entries,
            in_flight: DashSet::new(),
        }
    }

    /// Looks up a session's cached summary. `mini_moka`'s own TTL eviction
    /// already enforces the staleness bound, so a hit here is always
    /// acceptable to use as-is.
    pub fn get(&self, session_key: &str) -> Option<Arc<SummaryEntry>> {
        self.entries.get(session_key)
    }

    /// Writes a summary if the conversation has drifted enough from what's
    /// cached to be worth the new text: no prior entry, or the message/char
    /// delta against the prior entry clears the configured minimums.
    pub fn accept(&self, config: &SummaryCacheConfig, session_key: &str, entry: SummaryEntry) -> bool {
        let should_write = match self.entries.get(session_key) {
            None => true,
            Some(prior) => {
                let delta_messages = entry.message_count.saturating_sub(prior.message_count);
                let delta_chars = entry.char_count.abs_diff(prior.char_count);
                delta_messages >= config.min_delta_messages || delta_chars >= config.min_delta_chars
            }
        };

        if should_write {
            self.entries.insert(session_key.to_string(), Arc::new(entry));
        }

        should_write
    }

    /// Marks a session as having a background refresh in flight. Returns
    /// `false` if one was already running, so the caller can skip spawning
    /// a duplicate.
    pub fn start_refresh(&self, session_key: &str) -> bool {
        self.in_flight.insert(session_key.to_string())
    }

    pub fn finish_refresh(&self, session_key: &str) {
        self.in_flight.remove(session_key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SummaryCacheConfig {
        SummaryCacheConfig {
            enabled: true,
            min_delta_messages: 4,
            min_delta_chars: 4_000,
            max_age_secs: 1800,
            max_entries: 10_000,
        }
    }

    fn entry(text: &str, messages: usize, chars: usize) -> SummaryEntry {
        SummaryEntry {
            text: text.to_string(),
            message_count: messages,
            char_count: chars,
        }
    }

    #[test]
    fn first_write_for_a_session_always_accepted() {
        let cache = SummaryCache::new(&config());
        assert!(cache.accept(&config(), "session-a", entry("summary", 10, 2_000)));
        assert_eq!(cache.get("session-a").unwrap().text, "summary");
    }

    #[test]
    fn rejects_write_below_both_deltas() {
        let cache = SummaryCache::new(&config());
        cache.accept(&config(), "session-a", entry("first", 10, 2_000));

        let accepted = cache.accept(&config(), "session-a", entry("second", 11, 2_100));
        assert!(!accepted);
        assert_eq!(cache.get("session-a").unwrap().text, "first");
    }

    #[test]
    fn accepts_write_when_message_delta_clears_threshold() {
        let cache = SummaryCache::new(&config());
        cache.accept(&config(), "session-a", entry("first", 10, 2_000));

        let accepted = cache.accept(&config(), "session-a", entry("second", 15, 2_050));
        assert!(accepted);
        assert_eq!(cache.get("session-a").unwrap().text, "second");
    }

    #[test]
    fn accepts_write_when_char_delta_clears_threshold() {
        let cache = SummaryCache::new(&config());
        cache.accept(&config(), "session-a", entry("first", 10, 2_000));

        let accepted = cache.accept(&config(), "session-a", entry("second", 11, 7_000));
        assert!(accepted);
    }

    #[test]
    fn refresh_dedup_prevents_concurrent_double_start() {
        let cache = SummaryCache::new(&config());
        assert!(cache.start_refresh("session-a"));
        assert!(!cache.start_refresh("session-a"));

        cache.finish_refresh("session-a");
        assert!(cache.start_refresh("session-a"));
    }

    #[test]
    fn miss_for_unknown_session() {
        let cache = SummaryCache::new(&config());
        assert!(cache.get("unknown").is_none());
    }
}
