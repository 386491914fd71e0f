//! HTTP server configuration settings.

use std::net::SocketAddr;

use serde::Deserialize;

/// HTTP server configuration settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// The socket address the server should listen on.
    pub listen_address: SocketAddr,
    /// Health endpoint configuration.
    pub health: HealthConfig,
    /// Whether to send a permissive CORS layer on all responses.
    ///
    /// CORS policy and end-user authentication are handled upstream of this
    /// proxy; we only need enough of a layer that browser-based clients can
    /// reach it directly during development.
    pub cors_permissive: bool,
    /// Per-request deadline from HTTP ingress to final event, in seconds.
    pub request_deadline_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: SocketAddr::from(([127, 0, 0, 1], 8080)),
            health: HealthConfig::default(),
            cors_permissive: true,
            request_deadline_secs: 120,
        }
    }
}

/// Health endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthConfig {
    /// Whether the health endpoint is enabled.
    pub enabled: bool,
    /// The path the health endpoint is served on.
    pub path: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "/health".to_string(),
        }
    }
}
