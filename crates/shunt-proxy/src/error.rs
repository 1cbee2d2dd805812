//! Error types for the proxy core.

use thiserror::Error;

/// Errors raised by the proxy engine, its listeners and its certificate authority.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Invalid target URL '{0}': {1}")]
    InvalidUrl(String, String),
    #[error("Unsupported protocol '{0}'. Supported: http, https")]
    UnsupportedScheme(String),
    #[error("Failed to bind port {0}: {1}")]
    Bind(u16, std::io::Error),
    #[error("Certificate error: {0}")]
    Certificate(String),
    #[error("Can't install proxy certificate as trusted: {0}")]
    CertificateInstall(String),
    #[error("Certificate installation isn't implemented for platform '{0}'")]
    UnsupportedPlatform(&'static str),
    #[error("TLS configuration error: {0}")]
    Tls(String),
    #[error("Upstream request to {0} failed: {1}")]
    Upstream(String, String),
    #[error("Upstream {0} did not respond within {1}ms")]
    UpstreamTimeout(String, u64),
    #[error("Failed to read request body: {0}")]
    RequestBody(String),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised by the disk cache store.
///
/// Cloneable so that one initialization outcome can be handed to every waiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache I/O error on {path}: {message}")]
    Io { path: String, message: String },
    #[error("Corrupt cache entry {0}: {1}")]
    Corrupt(String, String),
}

impl CacheError {
    pub(crate) fn io(path: &std::path::Path, err: std::io::Error) -> Self {
        CacheError::Io {
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_scheme_message() {
        let err = ProxyError::UnsupportedScheme("ftp".to_string());
        assert_eq!(
            err.to_string(),
            "Unsupported protocol 'ftp'. Supported: http, https"
        );
    }

    #[test]
    fn test_cache_error_converts_into_proxy_error() {
        let err: ProxyError = CacheError::Corrupt("abc".into(), "eof".into()).into();
        assert!(matches!(err, ProxyError::Cache(CacheError::Corrupt(..))));
    }
}
