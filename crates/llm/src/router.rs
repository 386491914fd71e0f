//! Priority-ordered model router: decides Opus vs. Sonnet for a request.
//!
//! The policy is a cascade of rules evaluated in a fixed priority order;
//! the first one that fires wins. Probabilistic rules exist at the lower
//! priorities so that baseline traffic gets load-shifted across tiers
//! without ever overriding an explicit signal (whitelist header, marker,
//! keyword, extended thinking) higher up the list.

use std::sync::atomic::{AtomicU64, Ordering};

use config::ModelRoutingConfig;
use rand::Rng;

use crate::messages::unified::{UnifiedContentContainer, UnifiedRequest, UnifiedRole};
use crate::request::RequestContext;

/// The two tiers this proxy routes between. Concrete model ids live in
/// `UpstreamConfig`; this type only ever expresses the *tier*.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ModelTier {
    Opus,
    Sonnet,
}

/// The rule that decided a routing outcome, kept around for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RoutingReason {
    WhitelistHeader,
    WhitelistMarker,
    ExtendedThinking,
    FirstTurn,
    ForceOpusKeyword,
    ForceSonnetKeyword,
    ExecutionPhase,
    Baseline,
    /// The heuristic router is disabled entirely (`model_routing.enabled =
    /// false`); every request goes to the Opus tier.
    RouterDisabled,
}

impl RoutingReason {
    fn priority(self) -> u8 {
        match self {
            RoutingReason::RouterDisabled => 0,
            RoutingReason::WhitelistHeader | RoutingReason::WhitelistMarker => 0,
            RoutingReason::ExtendedThinking | RoutingReason::FirstTurn => 1,
            RoutingReason::ForceOpusKeyword => 2,
            RoutingReason::ForceSonnetKeyword => 3,
            RoutingReason::ExecutionPhase => 4,
            RoutingReason::Baseline => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RoutingDecision {
    pub tier: ModelTier,
    pub reason: RoutingReason,
}

/// Process-lifetime counters of routing outcomes, incremented atomically
/// on every decision.
#[derive(Default)]
pub(crate) struct RoutingCounters {
    opus: AtomicU64,
    sonnet: AtomicU64,
}

impl RoutingCounters {
    pub fn opus(&self) -> u64 {
        self.opus.load(Ordering::Relaxed)
    }

    pub fn sonnet(&self) -> u64 {
        self.sonnet.load(Ordering::Relaxed)
    }

    fn record(&self, tier: ModelTier) {
        match tier {
            ModelTier::Opus => self.opus.fetch_add(1, Ordering::Relaxed),
            ModelTier::Sonnet => self.sonnet.fetch_add(1, Ordering::Relaxed),
        };
    }
}

pub(crate) struct ModelRouter {
    config: ModelRoutingConfig,
    counters: RoutingCounters,
}

impl ModelRouter {
    pub fn new(config: ModelRoutingConfig) -> Self {
        Self {
            config,
            counters: RoutingCounters::default(),
        }
    }

    pub fn counters(&self) -> &RoutingCounters {
        &self.counters
    }

    /// Runs the priority cascade against a normalized request and returns
    /// the chosen tier plus the rule that fired, logging both.
    pub fn route(&self, request: &UnifiedRequest, context: &RequestContext) -> RoutingDecision {
        let decision = self.decide(request, context);
        self.counters.record(decision.tier);

        log::debug!(
            "routed request {} to {:?} via {:?}",
            context.request_id,
            decision.tier,
            decision.reason
        );

        decision
    }

    fn decide(&self, request: &UnifiedRequest, context: &RequestContext) -> RoutingDecision {
        if !self.config.enabled {
            return RoutingDecision {
                tier: ModelTier::Opus,
                reason: RoutingReason::RouterDisabled,
            };
        }
        if self.matches_whitelist_header(context) {
            return RoutingDecision {
                tier: ModelTier::Opus,
                reason: RoutingReason::WhitelistHeader,
            };
        }
        if self.matches_whitelist_marker(request) {
            return RoutingDecision {
                tier: ModelTier::Opus,
                reason: RoutingReason::WhitelistMarker,
            };
        }
        if request.extended_thinking == Some(true) {
            return RoutingDecision {
                tier: ModelTier::Opus,
                reason: RoutingReason::ExtendedThinking,
            };
        }
        if self.is_first_turn(request) {
            let tier = if roll(self.config.first_turn_opus_probability) {
                ModelTier::Opus
            } else {
                ModelTier::Sonnet
            };
            return RoutingDecision {
                tier,
                reason: RoutingReason::FirstTurn,
            };
        }
        if self.contains_keyword(request, &self.config.force_opus_keywords) {
            return RoutingDecision {
                tier: ModelTier::Opus,
                reason: RoutingReason::ForceOpusKeyword,
            };
        }
        if self.contains_keyword(request, &self.config.force_sonnet_keywords) {
            return RoutingDecision {
                tier: ModelTier::Sonnet,
                reason: RoutingReason::ForceSonnetKeyword,
            };
        }
        if self.tool_call_count(request) >= self.config.execution_phase_tool_calls {
            let tier = if roll(self.config.execution_phase_sonnet_probability) {
                ModelTier::Sonnet
            } else {
                ModelTier::Opus
            };
            return RoutingDecision {
                tier,
                reason: RoutingReason::ExecutionPhase,
            };
        }

        let tier = if roll(self.config.base_opus_probability) {
            ModelTier::Opus
        } else {
            ModelTier::Sonnet
        };
        RoutingDecision {
            tier,
            reason: RoutingReason::Baseline,
        }
    }

    fn matches_whitelist_header(&self, context: &RequestContext) -> bool {
        context
            .forced_model()
            .is_some_and(|v| v.eq_ignore_ascii_case("opus"))
    }

    fn matches_whitelist_marker(&self, request: &UnifiedRequest) -> bool {
        request
            .messages
            .iter()
            .any(|m| message_text(m).contains(self.config.whitelist_marker.as_str()))
    }

    fn is_first_turn(&self, request: &UnifiedRequest) -> bool {
        let user_turns = request.messages.iter().filter(|m| m.role == UnifiedRole::User).count();
        user_turns <= self.config.first_turn_max_user_messages
    }

    fn contains_keyword(&self, request: &UnifiedRequest, keywords: &[String]) -> bool {
        if keywords.is_empty() {
            return false;
        }
        request.messages.iter().any(|m| {
            let text = message_text(m);
            keywords.iter().any(|kw| text.contains(kw.as_str()))
        })
    }

    fn tool_call_count(&self, request: &UnifiedRequest) -> usize {
        request
            .messages
            .iter()
            .map(|m| m.tool_calls.as_ref().map(Vec::len).unwrap_or(0))
            .sum()
    }
}

fn roll(probability: f64) -> bool {
    rand::rng().random_bool(probability.clamp(0.0, 1.0))
}

fn message_text(message: &crate::messages::unified::UnifiedMessage) -> String {
    match &message.content {
        UnifiedContentContainer::Text(text) => text.clone(),
        UnifiedContentContainer::Blocks(blocks) => blocks
            .iter()
            .filter_map(|b| b.as_text())
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;
    use crate::messages::unified::UnifiedMessage;

    fn config() -> ModelRoutingConfig {
        ModelRoutingConfig {
            enabled: true,
            whitelist_header: "X-Force-Model".to_string(),
            whitelist_marker: "[FORCE_OPUS]".to_string(),
            first_turn_max_user_messages: 1,
            first_turn_opus_probability: 1.0,
            force_opus_keywords: vec!["urgent".to_string()],
            force_sonnet_keywords: vec!["simple".to_string()],
            execution_phase_tool_calls: 3,
            execution_phase_sonnet_probability: 1.0,
            base_opus_probability: 0.0,
        }
    }

    fn user(text: &str) -> UnifiedMessage {
        UnifiedMessage {
            role: UnifiedRole::User,
            content: UnifiedContentContainer::Text(text.to_string()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    fn request_with(messages: Vec<UnifiedMessage>, extended_thinking: Option<bool>) -> UnifiedRequest {
        UnifiedRequest {
            model: "proxy".to_string(),
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
            extended_thinking,
        }
    }

    fn context() -> RequestContext {
        RequestContext {
            request_id: "r1".to_string(),
            session_key: "s1".to_string(),
            headers: HeaderMap::new(),
        }
    }

    #[test]
    fn whitelist_header_wins_over_everything() {
        let router = ModelRouter::new(config());
        let mut headers = HeaderMap::new();
        headers.insert("X-Force-Model", "opus".parse().unwrap());
        let context = RequestContext {
            request_id: "r1".to_string(),
            session_key: "s1".to_string(),
            headers,
        };

        let decision = router.route(&request_with(vec![user("simple urgent")], None), &context);
        assert_eq!(decision.tier, ModelTier::Opus);
        assert_eq!(decision.reason, RoutingReason::WhitelistHeader);
    }

    #[test]
    fn inline_marker_routes_to_opus() {
        let router = ModelRouter::new(config());
        let decision = router.route(&request_with(vec![user("please [FORCE_OPUS] help")], None), &context());
        assert_eq!(decision.tier, ModelTier::Opus);
        assert_eq!(decision.reason, RoutingReason::WhitelistMarker);
    }

    #[test]
    fn extended_thinking_routes_to_opus() {
        let router = ModelRouter::new(config());
        let decision = router.route(&request_with(vec![user("a"), user("b")], Some(true)), &context());
        assert_eq!(decision.tier, ModelTier::Opus);
        assert_eq!(decision.reason, RoutingReason::ExtendedThinking);
    }

    #[test]
    fn first_turn_uses_configured_probability() {
        let router = ModelRouter::new(config());
        let decision = router.route(&request_with(vec![user("hello")], None), &context());
        assert_eq!(decision.tier, ModelTier::Opus);
        assert_eq!(decision.reason, RoutingReason::FirstTurn);
    }

    #[test]
    fn force_opus_keyword_beats_force_sonnet_keyword() {
        let router = ModelRouter::new(config());
        let request = request_with(vec![user("a"), user("this is urgent and simple"), user("c")], None);
        let decision = router.route(&request, &context());
        assert_eq!(decision.tier, ModelTier::Opus);
        assert_eq!(decision.reason, RoutingReason::ForceOpusKeyword);
    }

    #[test]
    fn force_sonnet_keyword_applies_without_opus_keyword() {
        let router = ModelRouter::new(config());
        let request = request_with(vec![user("a"), user("keep it simple"), user("c")], None);
        let decision = router.route(&request, &context());
        assert_eq!(decision.tier, ModelTier::Sonnet);
        assert_eq!(decision.reason, RoutingReason::ForceSonnetKeyword);
    }

    #[test]
    fn execution_phase_fires_on_tool_call_count() {
        let router = ModelRouter::new(config());
        let mut messages = vec![user("a"), user("b"), user("c")];
        for m in messages.iter_mut() {
            m.tool_calls = Some(vec![crate::messages::unified::UnifiedToolCall {
                id: "1".to_string(),
                function: crate::messages::unified::UnifiedFunctionCall {
                    name: "x".to_string(),
                    arguments: crate::messages::unified::UnifiedArguments::Value(serde_json::json!({})),
                },
            }]);
        }
        let decision = router.route(&request_with(messages, None), &context());
        assert_eq!(decision.tier, ModelTier::Sonnet);
        assert_eq!(decision.reason, RoutingReason::ExecutionPhase);
    }

    #[test]
    fn baseline_fires_with_no_other_signal() {
        let mut cfg = config();
        cfg.first_turn_max_user_messages = 0;
        let router = ModelRouter::new(cfg);
        let request = request_with(vec![user("a"), user("b")], None);
        let decision = router.route(&request, &context());
        assert_eq!(decision.tier, ModelTier::Sonnet);
        assert_eq!(decision.reason, RoutingReason::Baseline);
    }

    #[test]
    fn priority_table_matches_the_documented_cascade() {
        // Whitelist beats extended-thinking/first-turn beats force-Opus
        // keyword beats force-Sonnet keyword beats execution-phase beats
        // baseline — §8 testable property 7.
        assert!(RoutingReason::WhitelistHeader.priority() < RoutingReason::ExtendedThinking.priority());
        assert!(RoutingReason::ExtendedThinking.priority() < RoutingReason::ForceOpusKeyword.priority());
        assert!(RoutingReason::ForceOpusKeyword.priority() < RoutingReason::ForceSonnetKeyword.priority());
        assert!(RoutingReason::ForceSonnetKeyword.priority() < RoutingReason::ExecutionPhase.priority());
        assert!(RoutingReason::ExecutionPhase.priority() < RoutingReason::Baseline.priority());
    }

    #[test]
    fn disabled_router_always_routes_opus() {
        let mut cfg = config();
        cfg.enabled = false;
        let router = ModelRouter::new(cfg);
        let request = request_with(vec![user("keep it simple")], None);
        let decision = router.route(&request, &context());
        assert_eq!(decision.tier, ModelTier::Opus);
        assert_eq!(decision.reason, RoutingReason::RouterDisabled);
    }

    #[test]
    fn counters_increment_atomically() {
        let router = ModelRouter::new(config());
        router.route(&request_with(vec![user("hello")], None), &context());
        assert_eq!(router.counters().opus(), 1);
        assert_eq!(router.counters().sonnet(), 0);
    }
}
