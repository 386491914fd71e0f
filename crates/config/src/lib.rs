//! Chat-proxy configuration structures mapping the TOML configuration file.

#![deny(missing_docs)]

mod continuation;
mod error;
mod history;
mod loader;
mod routing;
mod server;
mod summary_cache;
mod tools;
mod upstream;

pub use continuation::ContinuationConfig;
pub use error::Error;
pub use history::HistoryConfig;
pub use routing::ModelRoutingConfig;
use serde::Deserialize;
pub use server::{HealthConfig, ServerConfig};
pub use summary_cache::{AsyncSummaryConfig, SummaryCacheConfig};
pub use tools::ToolsConfig;
pub use upstream::UpstreamConfig;

/// Root configuration structure for the chat proxy.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server configuration settings.
    pub server: ServerConfig,
    /// Upstream gateway and connection pool configuration.
    pub upstream: UpstreamConfig,
    /// History management engine configuration.
    pub history: HistoryConfig,
    /// Summary cache configuration.
    pub summary_cache: SummaryCacheConfig,
    /// Background summarization configuration.
    pub async_summary: AsyncSummaryConfig,
    /// Model router configuration.
    pub model_routing: ModelRoutingConfig,
    /// Tool-block codec and dialect converter tool configuration.
    pub tools: ToolsConfig,
    /// Continuation controller configuration.
    pub continuation: ContinuationConfig,
}

impl Config {
    /// Load configuration from a TOML file path, applying environment overrides.
    pub fn load<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Config> {
        loader::load(path)
    }

    /// Validates invariants across sections that can't be expressed through `serde` alone.
    pub fn validate(&self) -> anyhow::Result<()> {
        loader::validate(self)
    }
}

#[cfg(test)]
mod tests {
    use insta::assert_debug_snapshot;

    use crate::Config;

    #[test]
    fn defaults() {
        let config: Config = toml::from_str("").unwrap();

        assert_debug_snapshot!(&config, @r#"
        Config {
            server: ServerConfig {
                listen_address: 127.0.0.1:8080,
                health: HealthConfig {
                    enabled: true,
                    path: "/health",
                },
                cors_permissive: true,
                request_deadline_secs: 120,
            },
            upstream: UpstreamConfig {
                base_url: "http://localhost:11434",
                bearer_token: None,
                http_pool_max_connections: 100,
                http_pool_max_keepalive: 32,
                http_pool_keepalive_expiry_secs: 5,
                request_timeout_secs: 60,
                max_retries: 2,
                retry_backoff_base_ms: 200,
                opus_model: "claude-opus-4-5",
                sonnet_model: "claude-sonnet-4-5",
            },
            history: HistoryConfig {
                pre_estimate_enabled: true,
                auto_truncate_enabled: true,
                smart_summary_enabled: true,
                error_retry_enabled: true,
                estimate_threshold: 100000,
                max_messages: 100,
                max_chars: 120000,
                summary_threshold: 80000,
                summary_keep_recent: 8,
                retry_max_messages: 20,
                max_retries: 3,
                chars_per_token: 3.0,
            },
            summary_cache: SummaryCacheConfig {
                enabled: true,
                min_delta_messages: 4,
                min_delta_chars: 4000,
                max_age_secs: 1800,
                max_entries: 10000,
            },
            async_summary: AsyncSummaryConfig {
                enabled: true,
                fast_first_request: true,
                max_pending_tasks: 64,
                update_interval_messages: 10,
                task_timeout_secs: 30,
            },
            model_routing: ModelRoutingConfig {
                enabled: true,
                whitelist_header: "X-Force-Model",
                whitelist_marker: "[FORCE_OPUS]",
                first_turn_max_user_messages: 1,
                first_turn_opus_probability: 0.7,
                force_opus_keywords: [],
                force_sonnet_keywords: [],
                execution_phase_tool_calls: 3,
                execution_phase_sonnet_probability: 0.8,
                base_opus_probability: 0.3,
            },
            tools: ToolsConfig {
                native_tools_enabled: true,
                native_tools_fallback_enabled: true,
                tool_desc_max_chars: 1024,
                tool_param_desc_max_chars: 512,
            },
            continuation: ContinuationConfig {
                max_continuation_attempts: 3,
                min_resume_text_length: 10,
            },
        }
        "#);
    }
}
