//! Configuration types for the shunt proxies.

mod cache;
mod listen;
mod protocol;
mod upstream;

use std::path::Path;

use serde::{Deserialize, Serialize};

pub use cache::CacheConfig;
pub use listen::{ForwardConfig, InterceptConfig, MetricsConfig, ProxySettings};
pub use protocol::Protocol;
pub use upstream::{ConnectionPoolConfig, TargetUrl};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Fixed-target proxy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward: Option<ForwardConfig>,

    /// TLS-intercepting proxy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intercept: Option<InterceptConfig>,

    #[serde(default)]
    pub proxy: ProxySettings,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub connection_pool: ConnectionPoolConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a configuration file without validating it, for callers that
    /// apply overrides first.
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        Ok(serde_yaml::from_str(&contents)?)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.forward.is_none() && self.intercept.is_none() {
            anyhow::bail!(
                "No proxy configured. Provide a 'forward' section, an 'intercept' section, or both"
            );
        }

        if let Some(ref forward) = self.forward {
            let url = forward.url.as_deref().ok_or_else(|| {
                anyhow::anyhow!("'forward.url' is required for the forward proxy")
            })?;
            TargetUrl::parse(url)?;
        }

        for (name, speed) in [
            ("speed", self.proxy.speed),
            ("request_speed", self.proxy.request_speed),
            ("response_speed", self.proxy.response_speed),
        ] {
            if let Some(speed) = speed {
                if !speed.is_finite() || speed < 0.0 {
                    anyhow::bail!("'proxy.{name}' must be a non-negative number, got {speed}");
                }
            }
        }

        Ok(())
    }
}
