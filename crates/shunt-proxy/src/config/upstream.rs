//! Proxied target URL and connection pool configuration.

use super::protocol::Protocol;
use crate::error::ProxyError;
use hyper::http::uri::Authority;
use hyper::Uri;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Validated target of a forward proxy.
///
/// Only the scheme and authority are kept; request paths are appended as
/// received from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetUrl {
    raw: String,
    protocol: Protocol,
    authority: Authority,
}

impl TargetUrl {
    /// Parse and validate a target URL. Only `http` and `https` are accepted.
    pub fn parse(url: &str) -> Result<Self, ProxyError> {
        let uri: Uri = url
            .parse()
            .map_err(|e: hyper::http::uri::InvalidUri| {
                ProxyError::InvalidUrl(url.to_string(), e.to_string())
            })?;

        let scheme = uri
            .scheme_str()
            .ok_or_else(|| ProxyError::InvalidUrl(url.to_string(), "missing scheme".into()))?;
        let protocol = Protocol::from_scheme(scheme)
            .map_err(|_| ProxyError::UnsupportedScheme(scheme.into()))?;

        let authority = uri
            .authority()
            .cloned()
            .ok_or_else(|| ProxyError::InvalidUrl(url.to_string(), "missing host".into()))?;

        Ok(Self {
            raw: url.to_string(),
            protocol,
            authority,
        })
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn host(&self) -> &str {
        self.authority.host()
    }

    pub fn port(&self) -> u16 {
        self.authority
            .port_u16()
            .unwrap_or_else(|| self.protocol.default_port())
    }

    /// URL as it was configured
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// `scheme://authority` prefix used to build upstream request URIs
    pub fn origin(&self) -> String {
        format!("{}://{}", self.protocol.as_str(), self.authority)
    }

    /// Full upstream URI for a client request path.
    pub fn join(&self, path_and_query: &str) -> String {
        format!("{}{}", self.origin(), path_and_query)
    }
}

impl fmt::Display for TargetUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionPoolConfig {
    #[serde(default = "default_pool_max_idle_per_host")]
    pub max_idle_per_host: usize,

    #[serde(default = "default_pool_idle_timeout")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_keepalive_timeout")]
    pub keepalive_timeout_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: default_pool_max_idle_per_host(),
            idle_timeout_secs: default_pool_idle_timeout(),
            keepalive_timeout_secs: default_keepalive_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

fn default_pool_max_idle_per_host() -> usize {
    100
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_keepalive_timeout() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_http_target() {
        let target = TargetUrl::parse("http://localhost:3000").unwrap();
        assert_eq!(target.protocol(), Protocol::Http);
        assert_eq!(target.host(), "localhost");
        assert_eq!(target.port(), 3000);
        assert_eq!(target.join("/a?b=1"), "http://localhost:3000/a?b=1");
    }

    #[test]
    fn test_parse_https_target_default_port() {
        let target = TargetUrl::parse("https://example.test/some/path").unwrap();
        assert_eq!(target.protocol(), Protocol::Https);
        assert_eq!(target.port(), 443);
        assert_eq!(target.origin(), "https://example.test");
    }

    #[test]
    fn test_parse_rejects_ftp() {
        let err = TargetUrl::parse("ftp://example.test").unwrap_err();
        assert!(matches!(err, ProxyError::UnsupportedScheme(s) if s == "ftp"));
    }

    #[test]
    fn test_parse_rejects_missing_scheme() {
        assert!(matches!(
            TargetUrl::parse("/relative/only"),
            Err(ProxyError::InvalidUrl(..))
        ));
    }

    #[test]
    fn test_connection_pool_defaults() {
        let pool = ConnectionPoolConfig::default();
        assert_eq!(pool.max_idle_per_host, 100);
        assert_eq!(pool.connect_timeout_secs, 5);
    }
}
