//! Upstream gateway and HTTP connection pool configuration (C6).

use secrecy::SecretString;
use serde::Deserialize;

/// Connection pool and upstream-endpoint configuration for the shared HTTP client.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpstreamConfig {
    /// Base URL of the upstream conversational-AI gateway.
    pub base_url: String,
    /// Bearer token sent to the upstream gateway. Overridden by the
    /// `UPSTREAM_BEARER_TOKEN` environment variable when set.
    pub bearer_token: Option<SecretString>,
    /// Maximum number of idle connections kept open across all hosts.
    pub http_pool_max_connections: usize,
    /// Maximum number of idle keepalive connections kept open per host.
    pub http_pool_max_keepalive: usize,
    /// How long an idle keepalive connection is retained before closing, in seconds.
    pub http_pool_keepalive_expiry_secs: u64,
    /// Per-request timeout against the upstream gateway, in seconds.
    pub request_timeout_secs: u64,
    /// Maximum number of retries on transient (connect-reset / 5xx) errors.
    pub max_retries: u32,
    /// Base delay for the retry backoff, in milliseconds.
    pub retry_backoff_base_ms: u64,
    /// The model id to use for the high-capability tier.
    pub opus_model: String,
    /// The model id to use for the cheaper tier.
    pub sonnet_model: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            bearer_token: None,
            http_pool_max_connections: 100,
            http_pool_max_keepalive: 32,
            http_pool_keepalive_expiry_secs: 5,
            request_timeout_secs: 60,
            max_retries: 2,
            retry_backoff_base_ms: 200,
            opus_model: "claude-opus-4-5".to_string(),
            sonnet_model: "claude-sonnet-4-5".to_string(),
        }
    }
}
