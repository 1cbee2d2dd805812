//! HTTP client creation and configuration.
//!
//! One pooled client is built per proxy instance and shared by all of its
//! exchanges.

use super::response_ext::ProxyBody;
use super::tls::{install_crypto_provider, NoVerifier};
use crate::config::ConnectionPoolConfig;
use crate::error::ProxyError;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Type alias for the HTTP client used by the proxies.
pub type HttpClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, ProxyBody>;

/// Create a shared HTTP client with connection pooling.
///
/// Failed requests are never retried by the client itself; reconnects are
/// decided per exchange by the retry policy.
pub fn create_http_client(
    pool: &ConnectionPoolConfig,
    skip_tls_verify: bool,
) -> Result<HttpClient, ProxyError> {
    install_crypto_provider();

    let mut http_connector = HttpConnector::new();
    http_connector.set_keepalive(Some(Duration::from_secs(pool.keepalive_timeout_secs)));
    http_connector.set_connect_timeout(Some(Duration::from_secs(pool.connect_timeout_secs)));
    http_connector.set_nodelay(true);
    http_connector.enforce_http(false); // Allow both HTTP and HTTPS

    // Build HTTPS connector for HTTP/1.1 only
    let https_connector = if skip_tls_verify {
        warn!("Upstream TLS certificate verification DISABLED (development/testing only)");
        hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(
                rustls::ClientConfig::builder()
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(NoVerifier))
                    .with_no_client_auth(),
            )
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector)
    } else {
        hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|e| ProxyError::Tls(format!("Failed to load native root certificates: {e}")))?
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector)
    };

    let http_client = Client::builder(TokioExecutor::new())
        .pool_idle_timeout(Duration::from_secs(pool.idle_timeout_secs))
        .pool_max_idle_per_host(pool.max_idle_per_host)
        .retry_canceled_requests(false)
        .build(https_connector);

    debug!(
        "Connection pool configured (HTTP/1.1): max_idle={}, idle_timeout={}s, keepalive={}s",
        pool.max_idle_per_host, pool.idle_timeout_secs, pool.keepalive_timeout_secs
    );

    Ok(http_client)
}
