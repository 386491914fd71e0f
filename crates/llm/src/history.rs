//! History engine: keeps an ever-growing conversation within the upstream's
//! effective context budget.
//!
//! Four strategies run in a fixed order, each one only as aggressive as it
//! needs to be: a cheap char-count pre-estimate, a hard cap on message
//! count/chars, a cache-aware summarization pass for conversations that are
//! still too large after truncation, and a post-hoc shrink applied only
//! when the upstream itself rejected a request as too long.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use config::{AsyncSummaryConfig, HistoryConfig, SummaryCacheConfig};

use crate::messages::unified::{UnifiedContentContainer, UnifiedMessage, UnifiedRequest, UnifiedRole};
use crate::summary_cache::{SummaryCache, SummaryEntry};
use crate::token_counter;

/// A summarization call, injected so this module never has to name the
/// upstream client's concrete type (C3 must not depend on C6 directly —
/// the orchestrator closes over the real upstream call and hands it down
/// as a plain function value).
pub(crate) type SummaryFuture = Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send>>;

/// `Clone + 'static` so a background fast-first refresh (§4.3) can move its
/// own copy into a spawned task instead of borrowing from the calling request.
pub(crate) trait SummaryFn: Fn(String) -> SummaryFuture + Send + Sync + Clone + 'static {}
impl<T> SummaryFn for T where T: Fn(String) -> SummaryFuture + Send + Sync + Clone + 'static {}

/// Observable outcome of a history-engine pass, surfaced by the
/// orchestrator as a response warning header.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct HistoryReport {
    pub was_truncated: bool,
    pub truncate_info: Option<String>,
}

impl HistoryReport {
    fn mark(&mut self, reason: impl Into<String>) {
        self.was_truncated = true;
        self.truncate_info = Some(match self.truncate_info.take() {
            Some(existing) => format!("{existing}; {}", reason.into()),
            None => reason.into(),
        });
    }
}

pub(crate) struct HistoryEngine {
    config: HistoryConfig,
    summary_cache_config: SummaryCacheConfig,
    async_summary_config: AsyncSummaryConfig,
    summary_cache: Arc<SummaryCache>,
    /// Background summarization tasks currently in flight, bounded by
    /// `async_summary_config.max_pending_tasks`. Excess refreshes are
    /// dropped with a warning rather than queued.
    pending_tasks: Arc<AtomicUsize>,
}

impl HistoryEngine {
    pub fn new(
        config: HistoryConfig,
        summary_cache_config: SummaryCacheConfig,
        async_summary_config: AsyncSummaryConfig,
        summary_cache: Arc<SummaryCache>,
    ) -> Self {
        Self {
            config,
            summary_cache_config,
            async_summary_config,
            summary_cache,
            pending_tasks: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Synchronous pass: PRE_ESTIMATE then AUTO_TRUNCATE. No summarization,
    /// so this never needs network access or an async context.
    pub fn pre_process(&self, request: &mut UnifiedRequest) -> HistoryReport {
        let mut report = HistoryReport::default();

        if self.config.pre_estimate_enabled {
            self.apply_pre_estimate(request, &mut report);
        }
        if self.config.auto_truncate_enabled {
            self.apply_auto_truncate(request, &mut report);
        }

        report
    }

    /// Full pass including SMART_SUMMARY, for callers with a usable
    /// `summary_fn`. Falls back to `pre_process`'s behavior if summarization
    /// isn't enabled or doesn't apply.
    pub async fn pre_process_async<F: SummaryFn>(
        &self,
        request: &mut UnifiedRequest,
        session_key: &str,
        summary_fn: &F,
    ) -> HistoryReport {
        let mut report = self.pre_process(request);

        if self.config.smart_summary_enabled && should_summarize(&self.config, request) {
            self.apply_smart_summary(request, session_key, summary_fn, &mut report).await;
        }

        report
    }

    /// Invoked only after the upstream rejected a request as too long.
    /// Shrinks the retained tail by ~30% and reports whether the caller
    /// should retry with the reduced history.
    pub async fn handle_length_error<F: SummaryFn>(
        &self,
        request: &mut UnifiedRequest,
        retry_count: u32,
        session_key: &str,
        summary_fn: &F,
    ) -> bool {
        if !self.config.error_retry_enabled || retry_count >= self.config.max_retries {
            return false;
        }

        if self.config.smart_summary_enabled && request.messages.len() > self.config.summary_keep_recent {
            let mut report = HistoryReport::default();
            self.apply_smart_summary(request, session_key, summary_fn, &mut report).await;
            return true;
        }

        let current = request.messages.len().max(1);
        let target = ((current as f64) * 0.7).ceil() as usize;
        let target = target.clamp(1, self.config.retry_max_messages).min(current.saturating_sub(1).max(1));

        drop_oldest_pairwise(&mut request.messages, target);
        true
    }

    fn apply_pre_estimate(&self, request: &mut UnifiedRequest, report: &mut HistoryReport) {
        let total_chars = estimate_request_chars(request);
        if !should_pre_truncate(&self.config, total_chars) {
            return;
        }

        let target_chars = (self.config.estimate_threshold as f64 * 0.8) as usize;
        while request.messages.len() > 1 && estimate_history_size(&request.messages) > target_chars {
            request.messages.remove(0);
        }
        report.mark(format!(
            "pre-estimate truncated history to {} chars (threshold {})",
            estimate_history_size(&request.messages),
            self.config.estimate_threshold
        ));
    }

    fn apply_auto_truncate(&self, request: &mut UnifiedRequest, report: &mut HistoryReport) {
        if request.messages.len() > self.config.max_messages {
            let keep_from = request.messages.len() - self.config.max_messages;
            request.messages.drain(0..keep_from);
            report.mark(format!(
                "truncated to the most recent {} messages",
                self.config.max_messages
            ));
        }

        if estimate_request_chars(request) > self.config.max_chars {
            let before = request.messages.len();
            while request.messages.len() > 1 && estimate_request_chars(request) > self.config.max_chars {
                drop_oldest_pairwise(&mut request.messages, request.messages.len() - 1);
            }
            if request.messages.len() != before {
                report.mark(format!("dropped oldest turns to fit {} char budget", self.config.max_chars));
            }
        }
    }

    async fn apply_smart_summary<F: SummaryFn>(
        &self,
        request: &mut UnifiedRequest,
        session_key: &str,
        summary_fn: &F,
        report: &mut HistoryReport,
    ) {
        let keep_recent = self.config.summary_keep_recent;
        if request.messages.len() <= keep_recent {
            return;
        }

        let split_at = request.messages.len() - keep_recent;
        let older = &request.messages[..split_at];
        let older_chars: usize = older.iter().map(message_chars).sum();

        if !self.summary_cache_config.enabled {
            // C4 turned off entirely: summarize synchronously on every call,
            // same fallback-to-truncate semantics as a cold cache miss below,
            // just without ever consulting or populating the cache.
            return match summary_fn(summarization_prompt(older)).await {
                Ok(text) => self.splice_summary(request, split_at, &text, report),
                Err(e) => {
                    log::warn!("summary_fn failed, falling back to auto-truncate: {e}");
                    self.apply_auto_truncate(request, report);
                }
            };
        }

        let cached = self.summary_cache.get(session_key);
        let summary_text = match cached {
            Some(entry) => {
                if self.async_summary_config.enabled
                    && older.len().saturating_sub(entry.message_count) >= self.async_summary_config.update_interval_messages
                {
                    self.spawn_background_refresh(session_key, older, older_chars, Clone::clone(summary_fn));
                }
                entry.text.clone()
            }
            None if self.async_summary_config.enabled && self.async_summary_config.fast_first_request => {
                // Fast-first (§4.3): don't block this request on a cold cache.
                // Return a plain truncation now and populate the cache in the
                // background so the *next* request on this session gets the
                // real summary without paying for it itself.
                self.spawn_background_refresh(session_key, older, older_chars, Clone::clone(summary_fn));
                self.apply_auto_truncate(request, report);
                report.mark("no cached summary yet; truncated while one computes in the background");
                return;
            }
            None => match summary_fn(summarization_prompt(older)).await {
                Ok(text) => {
                    self.summary_cache.accept(
                        &self.summary_cache_config,
                        session_key,
                        SummaryEntry {
                            text: text.clone(),
                            message_count: older.len(),
                            char_count: older_chars,
                        },
                    );
                    text
                }
                Err(e) => {
                    log::warn!("summary_fn failed, falling back to auto-truncate: {e}");
                    self.apply_auto_truncate(request, report);
                    return;
                }
            },
        };

        self.splice_summary(request, split_at, &summary_text, report);
    }

    /// Replaces `request.messages[..split_at]` with the synthetic
    /// summary/acknowledgement pair, keeping everything from `split_at`
    /// onward untouched.
    fn splice_summary(&self, request: &mut UnifiedRequest, split_at: usize, summary_text: &str, report: &mut HistoryReport) {
        let recent = request.messages.split_off(split_at);
        request.messages = vec![
            synthetic_user(format!("[Earlier conversation summary]\n{summary_text}\n\n[Continuing...]")),
            synthetic_assistant("Understood, continuing from that summary."),
        ];
        request.messages.extend(recent);

        report.mark("summarized earlier turns of the conversation");
    }

    /// Fires a fire-and-forget summarization task, deduplicated per session
    /// (so a burst of concurrent requests on the same conversation doesn't
    /// spawn one refresh each) and bounded by `max_pending_tasks` (excess
    /// refreshes are dropped with a warning instead of queued).
    fn spawn_background_refresh<F: SummaryFn>(&self, session_key: &str, older: &[UnifiedMessage], older_chars: usize, summary_fn: F) {
        if !self.summary_cache.start_refresh(session_key) {
            return;
        }
        if self.pending_tasks.fetch_add(1, Ordering::SeqCst) >= self.async_summary_config.max_pending_tasks {
            self.pending_tasks.fetch_sub(1, Ordering::SeqCst);
            self.summary_cache.finish_refresh(session_key);
            log::warn!("dropping background summary refresh for session {session_key}: max_pending_tasks reached");
            return;
        }

        let session_key = session_key.to_string();
        let prompt = summarization_prompt(older);
        let message_count = older.len();
        let summary_cache = self.summary_cache.clone();
        let summary_cache_config = self.summary_cache_config.clone();
        let pending_tasks = self.pending_tasks.clone();
        let timeout = Duration::from_secs(self.async_summary_config.task_timeout_secs);

        tokio::spawn(async move {
            match tokio::time::timeout(timeout, summary_fn(prompt)).await {
                Ok(Ok(text)) => {
                    summary_cache.accept(
                        &summary_cache_config,
                        &session_key,
                        SummaryEntry {
                            text,
                            message_count,
                            char_count: older_chars,
                        },
                    );
                }
                Ok(Err(e)) => log::warn!("background summary refresh failed for session {session_key}: {e}"),
                Err(_) => log::warn!(
                    "background summary refresh for session {session_key} exceeded its {}s budget",
                    timeout.as_secs()
                ),
            }

            summary_cache.finish_refresh(&session_key);
            pending_tasks.fetch_sub(1, Ordering::SeqCst);
        });
    }
}

fn summarization_prompt(older: &[UnifiedMessage]) -> String {
    let transcript = older
        .iter()
        .map(|m| format!("{:?}: {}", m.role, message_text(m)))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "Summarize the conversation below as a structured extraction covering: \
         the user's goals, work completed so far, the current state, and any \
         key files or identifiers mentioned. Be concise.\n\n{transcript}"
    )
}

fn synthetic_user(text: String) -> UnifiedMessage {
    UnifiedMessage {
        role: UnifiedRole::User,
        content: UnifiedContentContainer::Text(text),
        tool_calls: None,
        tool_call_id: None,
    }
}

fn synthetic_assistant(text: &str) -> UnifiedMessage {
    UnifiedMessage {
        role: UnifiedRole::Assistant,
        content: UnifiedContentContainer::Text(text.to_string()),
        tool_calls: None,
        tool_call_id: None,
    }
}

fn message_text(message: &UnifiedMessage) -> String {
    match &message.content {
        UnifiedContentContainer::Text(text) => text.clone(),
        UnifiedContentContainer::Blocks(blocks) => blocks
            .iter()
            .filter_map(|b| b.as_text())
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

fn message_chars(message: &UnifiedMessage) -> usize {
    message_text(message).len()
}

/// Drops messages from the front, removing a user message together with
/// its immediately following assistant reply so T2 (tool-pairing/role
/// alternation) survives the cut, until at most `target_len` remain.
fn drop_oldest_pairwise(messages: &mut Vec<UnifiedMessage>, target_len: usize) {
    while messages.len() > target_len {
        let removed_role = messages.remove(0).role;
        if removed_role == UnifiedRole::User && messages.first().map(|m| m.role) == Some(UnifiedRole::Assistant) && messages.len() > target_len
        {
            messages.remove(0);
        }
    }
}

pub(crate) fn should_pre_truncate(config: &HistoryConfig, total_chars: usize) -> bool {
    total_chars > config.estimate_threshold
}

pub(crate) fn should_summarize(config: &HistoryConfig, request: &UnifiedRequest) -> bool {
    estimate_request_chars(request) > config.summary_threshold && request.messages.len() > config.summary_keep_recent
}

pub(crate) fn estimate_history_size(messages: &[UnifiedMessage]) -> usize {
    messages.iter().map(message_chars).sum()
}

pub(crate) fn estimate_request_chars(request: &UnifiedRequest) -> usize {
    token_counter::estimate_request_chars(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::summary_cache::SummaryCache;
    use config::SummaryCacheConfig;

    fn user(text: &str) -> UnifiedMessage {
        UnifiedMessage {
            role: UnifiedRole::User,
            content: UnifiedContentContainer::Text(text.to_string()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    fn assistant(text: &str) -> UnifiedMessage {
        UnifiedMessage {
            role: UnifiedRole::Assistant,
            content: UnifiedContentContainer::Text(text.to_string()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    fn request_with(messages: Vec<UnifiedMessage>) -> UnifiedRequest {
        UnifiedRequest {
            model: "sonnet".to_string(),
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

    fn history_config() -> HistoryConfig {
        HistoryConfig {
            pre_estimate_enabled: true,
            auto_truncate_enabled: true,
            smart_summary_enabled: true,
            error_retry_enabled: true,
            estimate_threshold: 100_000,
            max_messages: 6,
            max_chars: 500,
            summary_threshold: 300,
            summary_keep_recent: 2,
            retry_max_messages: 20,
            max_retries: 3,
            chars_per_token: 3.0,
        }
    }

    fn summary_cache_config() -> SummaryCacheConfig {
        SummaryCacheConfig {
            enabled: true,
            min_delta_messages: 4,
            min_delta_chars: 4_000,
            max_age_secs: 1800,
            max_entries: 10_000,
        }
    }

    /// Background refresh disabled by default so existing tests exercise the
    /// synchronous summarization path; fast-first behavior gets its own test.
    fn async_summary_config() -> AsyncSummaryConfig {
        AsyncSummaryConfig {
            enabled: false,
            fast_first_request: true,
            max_pending_tasks: 64,
            update_interval_messages: 10,
            task_timeout_secs: 30,
        }
    }

    fn engine() -> HistoryEngine {
        HistoryEngine::new(
            history_config(),
            summary_cache_config(),
            async_summary_config(),
            Arc::new(SummaryCache::new(&summary_cache_config())),
        )
    }

    #[test]
    fn auto_truncate_keeps_only_max_messages() {
        let engine = engine();
        let mut request = request_with((0..10).map(|i| user(&format!("turn {i}"))).collect());

        let report = engine.pre_process(&mut request);

        assert_eq!(request.messages.len(), 6);
        assert!(report.was_truncated);
        assert_eq!(request.messages[0].role, UnifiedRole::User);
        let UnifiedContentContainer::Text(text) = &request.messages[0].content else {
            unreachable!()
        };
        assert_eq!(text, "turn 4");
    }

    #[test]
    fn no_op_when_under_every_budget() {
        let engine = engine();
        let mut request = request_with(vec![user("hi"), assistant("hello")]);

        let report = engine.pre_process(&mut request);

        assert!(!report.was_truncated);
        assert_eq!(request.messages.len(), 2);
    }

    #[test]
    fn char_budget_drops_oldest_pairs_preserving_alternation() {
        let engine = engine();
        let big = "x".repeat(200);
        let mut request = request_with(vec![
            user(&big),
            assistant(&big),
            user(&big),
            assistant("short reply"),
        ]);

        engine.pre_process(&mut request);

        assert!(estimate_request_chars(&request) <= 500 || request.messages.len() <= 1);
        // alternation preserved: no two same-role messages adjacent at the
        // point where we stopped removing pairs
        for pair in request.messages.windows(2) {
            assert_ne!(pair[0].role, pair[1].role);
        }
    }

    #[tokio::test]
    async fn smart_summary_replaces_older_turns_with_summary_text() {
        let engine = engine();
        let big = "x".repeat(150);
        let mut request = request_with(vec![
            user(&big),
            assistant(&big),
            user(&big),
            assistant(&big),
            user("final question"),
        ]);

        let summary_fn = |_: String| -> SummaryFuture { Box::pin(async { Ok("condensed summary".to_string()) }) };

        let report = engine.pre_process_async(&mut request, "session-1", &summary_fn).await;

        assert!(report.was_truncated);
        assert_eq!(request.messages.len(), 4); // synthetic user + synthetic assistant + 2 recent
        let UnifiedContentContainer::Text(text) = &request.messages[0].content else {
            unreachable!()
        };
        assert!(text.contains("condensed summary"));
    }

    #[tokio::test]
    async fn summary_cache_hit_skips_calling_summary_fn_again() {
        let engine = engine();
        let big = "x".repeat(150);
        let mut request = request_with(vec![
            user(&big),
            assistant(&big),
            user(&big),
            assistant(&big),
            user("final question"),
        ]);

        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let summary_fn = |_: String| -> SummaryFuture { Box::pin(async { Ok("first summary".to_string()) }) };
        engine.pre_process_async(&mut request, "session-2", &summary_fn).await;

        let mut second_request = request_with(vec![
            user(&big),
            assistant(&big),
            user(&big),
            assistant(&big),
            user("another question"),
        ]);
        let counting_calls = calls.clone();
        let counting_fn = move |_: String| -> SummaryFuture {
            counting_calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Box::pin(async { Ok("should not be used".to_string()) })
        };
        engine
            .pre_process_async(&mut second_request, "session-2", &counting_fn)
            .await;

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        let UnifiedContentContainer::Text(text) = &second_request.messages[0].content else {
            unreachable!()
        };
        assert!(text.contains("first summary"));
    }

    #[tokio::test]
    async fn summary_fn_failure_falls_back_to_auto_truncate() {
        let engine = engine();
        let big = "x".repeat(150);
        let mut request = request_with(vec![
            user(&big),
            assistant(&big),
            user(&big),
            assistant(&big),
            user("final question"),
        ]);

        let summary_fn = |_: String| -> SummaryFuture { Box::pin(async { Err(anyhow::anyhow!("boom")) }) };
        let report = engine.pre_process_async(&mut request, "session-3", &summary_fn).await;

        assert!(report.was_truncated);
        // Fell back to truncation rather than summarization: no synthetic
        // "[Earlier conversation summary]" marker present.
        let has_summary_marker = request.messages.iter().any(|m| {
            matches!(&m.content, UnifiedContentContainer::Text(t) if t.contains("Earlier conversation summary"))
        });
        assert!(!has_summary_marker);
    }

    #[tokio::test]
    async fn disabled_summary_cache_summarizes_fresh_every_call_without_caching() {
        let mut cache_config = summary_cache_config();
        cache_config.enabled = false;
        let summary_cache = Arc::new(SummaryCache::new(&cache_config));
        let engine = HistoryEngine::new(history_config(), cache_config, async_summary_config(), summary_cache.clone());

        let big = "x".repeat(150);
        let mut request = request_with(vec![
            user(&big),
            assistant(&big),
            user(&big),
            assistant(&big),
            user("final question"),
        ]);

        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counting_calls = calls.clone();
        let summary_fn = move |_: String| -> SummaryFuture {
            counting_calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Box::pin(async { Ok("fresh summary".to_string()) })
        };

        engine.pre_process_async(&mut request, "session-disabled-cache", &summary_fn).await;

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        // Cache disabled entirely: nothing gets written, so a second request
        // on the same session would call summary_fn again rather than hit.
        assert!(summary_cache.get("session-disabled-cache").is_none());
    }

    #[tokio::test]
    async fn fast_first_returns_truncation_immediately_and_populates_cache_in_background() {
        let mut config = async_summary_config();
        config.enabled = true;
        let cache_config = summary_cache_config();
        let summary_cache = Arc::new(SummaryCache::new(&cache_config));
        let engine = HistoryEngine::new(history_config(), cache_config, config, summary_cache.clone());

        let big = "x".repeat(150);
        let mut request = request_with(vec![
            user(&big),
            assistant(&big),
            user(&big),
            assistant(&big),
            user("final question"),
        ]);

        let summary_fn = |_: String| -> SummaryFuture { Box::pin(async { Ok("background summary".to_string()) }) };
        let report = engine.pre_process_async(&mut request, "session-fast-first", &summary_fn).await;

        // First request on a cold cache never blocks on summarization: it
        // just gets the plain truncation this request, immediately.
        assert!(report.was_truncated);
        let has_summary_marker = request.messages.iter().any(|m| {
            matches!(&m.content, UnifiedContentContainer::Text(t) if t.contains("Earlier conversation summary"))
        });
        assert!(!has_summary_marker);

        // Give the spawned background task a chance to run to completion.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(summary_cache.get("session-fast-first").unwrap().text, "background summary");
    }

    #[tokio::test]
    async fn handle_length_error_shrinks_tail_and_allows_retry() {
        let engine = engine();
        let mut request = request_with((0..10).map(|i| user(&format!("turn {i}"))).collect());
        request.messages = (0..10)
            .map(|i| if i % 2 == 0 { user(&format!("u{i}")) } else { assistant(&format!("a{i}")) })
            .collect();

        let summary_fn = |_: String| -> SummaryFuture { Box::pin(async { Ok("s".to_string()) }) };
        let should_retry = engine.handle_length_error(&mut request, 0, "session-4", &summary_fn).await;

        assert!(should_retry);
        assert!(request.messages.len() < 10);
    }

    #[tokio::test]
    async fn handle_length_error_stops_retrying_past_max_retries() {
        let engine = engine();
        let mut request = request_with(vec![user("a"), assistant("b")]);
        let summary_fn = |_: String| -> SummaryFuture { Box::pin(async { Ok("s".to_string()) }) };

        let should_retry = engine.handle_length_error(&mut request, 3, "session-5", &summary_fn).await;
        assert!(!should_retry);
    }
}
