use std::{sync::OnceLock, time::Duration};

use axum::http;
use config::UpstreamConfig;
use reqwest::Client;

pub(crate) fn default_http_client_builder(config: &UpstreamConfig) -> reqwest::ClientBuilder {
    let mut headers = http::HeaderMap::new();
    headers.insert(http::header::CONNECTION, http::HeaderValue::from_static("keep-alive"));

    Client::builder()
        .timeout(Duration::from_secs(config.request_timeout_secs))
        // Hyper connection pool only exposes two parameters max idle connections per host
        // and idle connection timeout. There is not TTL on the connections themselves to
        // force a refresh, necessary if the DNS changes its records. Somehow, even within
        // a benchmark ramping *up* traffic, we do pick up DNS changes by setting a pool
        // idle timeout even though in theory no connection should be idle? A bit confusing,
        // and I suspect I don't fully understand how Hyper is managing connections
        // underneath. But seems like the best choice we have right now.
        .pool_idle_timeout(Some(Duration::from_secs(config.http_pool_keepalive_expiry_secs)))
        .pool_max_idle_per_host(config.http_pool_max_keepalive)
        // HTTP/2 is explicitly off: upstream request multiplexing over one
        // connection would co-mingle unrelated requests on a connection-reset.
        .http1_only()
        .tcp_nodelay(true)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .default_headers(headers)
}

/// Common HTTP client to re-use as much as possible the same connections.
///
/// The total-connections cap (`http_pool_max_connections`) isn't something
/// reqwest/Hyper expose directly — there is no "max total connections"
/// knob, only a per-host idle cap — so it's enforced by the caller via a
/// semaphore around dispatch rather than here.
pub(crate) fn http_client(config: &UpstreamConfig) -> reqwest::Client {
    static CLIENT: OnceLock<Client> = OnceLock::new();

    CLIENT
        .get_or_init(|| {
            default_http_client_builder(config)
                .build()
                .expect("Failed to build default HTTP client")
        })
        .clone()
}
