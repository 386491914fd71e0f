//! Chat-proxy server library.
//!
//! Provides a reusable server function to serve the proxy either for the
//! binary, or for integration tests.

#![deny(missing_docs)]

mod health;
pub mod logger;

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::anyhow;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::{Router, routing::get};
use config::Config;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

/// Configuration for serving the chat proxy.
pub struct ServeConfig {
    /// The socket address (IP and port) the server will bind to.
    pub listen_address: SocketAddr,
    /// The deserialized TOML configuration.
    pub config: Config,
    /// Cancellation token for graceful shutdown.
    pub shutdown_signal: CancellationToken,
    /// The version string to log on startup.
    pub version: String,
    /// Optional oneshot sender to send back the bound address (useful if port 0 was specified).
    pub bound_addr_sender: Option<tokio::sync::oneshot::Sender<SocketAddr>>,
}

/// Starts and runs the chat proxy server with the provided configuration.
pub async fn serve(
    ServeConfig {
        listen_address,
        config,
        shutdown_signal,
        version,
        bound_addr_sender,
    }: ServeConfig,
) -> anyhow::Result<()> {
    log::info!("chat-proxy {version}");

    let cors = if config.server.cors_permissive {
        CorsLayer::permissive()
    } else {
        CorsLayer::new()
    };

    let deadline = Duration::from_secs(config.server.request_deadline_secs);

    let mut app = llm::router(&config)
        .await
        .map_err(|err| anyhow!("Failed to initialize LLM router: {err}"))?
        .layer(middleware::from_fn_with_state(deadline, enforce_request_deadline))
        .layer(cors.clone());

    if config.server.health.enabled {
        let health_router = Router::new()
            .route(&config.server.health.path, get(health::health))
            .layer(cors);

        app = app.merge(health_router);
    }

    let listener = TcpListener::bind(listen_address)
        .await
        .map_err(|e| anyhow!("Failed to bind to {listen_address}: {e}"))?;

    if let Some(sender) = bound_addr_sender {
        sender
            .send(listener.local_addr()?)
            .expect("Failed to send back bound address.");
    }

    log::info!("Anthropic endpoint: http://{listen_address}/v1/messages");
    log::info!("OpenAI endpoint: http://{listen_address}/v1/chat/completions");

    tokio::select! {
        result = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()) => {
            result.map_err(|e| anyhow!("Failed to start HTTP server: {e}"))?;
        }
        _ = shutdown_signal.cancelled() => {
            log::info!("Received shutdown signal, shutting down gracefully...");
        }
    }

    Ok(())
}

/// Bounds the time from HTTP ingress to the handler returning its response
/// (for a streaming route, that's the time to start the SSE body, not the
/// full stream duration) to `config.server.request_deadline_secs`. A tripped
/// deadline surfaces as a 504 rather than hanging the connection open against
/// a stuck upstream.
async fn enforce_request_deadline(State(deadline): State<Duration>, request: Request, next: Next) -> Response {
    match tokio::time::timeout(deadline, next.run(request)).await {
        Ok(response) => response,
        Err(_) => (StatusCode::GATEWAY_TIMEOUT, "request exceeded its deadline").into_response(),
    }
}
