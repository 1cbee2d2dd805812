//! Listener, exchange and metrics configuration.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

/// Forward proxy: every request is relayed to one fixed target.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ForwardConfig {
    pub url: Option<String>,
    /// Listen port (0 = OS-assigned)
    #[serde(default)]
    pub port: u16,
}

/// Intercepting proxy: terminates TLS with a local certificate authority.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InterceptConfig {
    #[serde(default = "default_intercept_port")]
    pub port: u16,
    #[serde(default = "default_ca_dir")]
    pub ca_dir: PathBuf,
    /// Install the CA certificate into the OS trust store on start
    #[serde(default)]
    pub install_certificate: bool,
}

impl Default for InterceptConfig {
    fn default() -> Self {
        Self {
            port: default_intercept_port(),
            ca_dir: default_ca_dir(),
            install_certificate: false,
        }
    }
}

fn default_intercept_port() -> u16 {
    8888
}

fn default_ca_dir() -> PathBuf {
    PathBuf::from(".shunt-ca")
}

/// Per-exchange settings shared by both proxy modes.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxySettings {
    /// Time to wait for the upstream response, ms
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Reconnect attempts after an upstream connection error
    #[serde(default = "default_reconnect")]
    pub reconnect: u32,
    /// Speed limit in kb/s for both directions
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default)]
    pub request_speed: Option<f64>,
    #[serde(default)]
    pub response_speed: Option<f64>,
    /// Skip upstream certificate verification
    #[serde(default)]
    pub tls_skip_verify: bool,
    /// Interface the proxy listeners bind to
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
}

impl ProxySettings {
    /// Upload rate, falling back to `speed`.
    pub fn effective_request_speed(&self) -> Option<f64> {
        self.request_speed.or(self.speed)
    }

    /// Download rate, falling back to `speed`.
    pub fn effective_response_speed(&self) -> Option<f64> {
        self.response_speed.or(self.speed)
    }
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            reconnect: default_reconnect(),
            speed: None,
            request_speed: None,
            response_speed: None,
            tls_skip_verify: false,
            bind_address: default_bind_address(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    60_000
}

fn default_reconnect() -> u32 {
    2
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Serve Prometheus metrics on this port when set
    #[serde(default)]
    pub port: Option<u16>,
}
