//! Operations shared by both proxy modes.

use super::lifecycle::ProxyState;
use super::settings::{LiveSettings, SpeedSetting};
use crate::cache::ResponseCache;
use crate::config::{ConnectionPoolConfig, ProxySettings};
use crate::error::ProxyError;
use crate::middleware::MeasurementRecord;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::warn;

/// Construction options of a proxy instance.
#[derive(Clone, Default)]
pub struct ProxyOptions {
    /// Listen port; 0 picks a free one
    pub port: u16,
    pub settings: ProxySettings,
    pub pool: ConnectionPoolConfig,
    /// Cache used when the cache flag is on; initialized on start
    pub cache: Option<Arc<ResponseCache>>,
    pub use_cache: bool,
}

impl ProxyOptions {
    pub(crate) fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.settings.bind_address, self.port)
    }

    /// Initial cache flag; never on without a cache to use.
    pub(crate) fn initial_use_cache(&self) -> bool {
        if self.use_cache && self.cache.is_none() {
            warn!("Cache requested but no cache attached; caching stays off");
            return false;
        }
        self.use_cache
    }
}

/// Control surface of a running or stopped proxy.
#[async_trait]
pub trait ProxyControl: Send + Sync {
    /// Start listening. `Ok(false)` when already running.
    async fn start(&self) -> Result<bool, ProxyError>;

    /// Stop listening. `false` when not running.
    async fn stop(&self) -> bool;

    fn state(&self) -> ProxyState;

    /// Bound address while running.
    fn local_addr(&self) -> Option<SocketAddr>;

    fn live(&self) -> &LiveSettings;

    /// Whether a response cache is attached.
    fn has_cache(&self) -> bool;

    fn is_running(&self) -> bool {
        self.state() == ProxyState::Running
    }

    fn port(&self) -> Option<u16> {
        self.local_addr().map(|addr| addr.port())
    }

    /// Address clients use to reach the proxy.
    fn url(&self) -> Option<String> {
        self.local_addr().map(|addr| format!("http://{addr}"))
    }

    /// Throttle exchanges created from now on.
    ///
    /// Returns `false` when the proxy is not running; the setting is kept
    /// for the next start.
    fn set_speed(&self, speed: SpeedSetting) -> bool {
        self.live().set_speed(speed);
        self.is_running()
    }

    /// Remove every speed limit.
    fn reset_speed(&self) -> bool {
        self.live().reset_speed();
        self.is_running()
    }

    /// Turn caching on or off. Turning it on fails without an attached cache.
    fn set_use_cache(&self, enabled: bool) -> bool {
        if enabled && !self.has_cache() {
            warn!("Can't enable caching: no cache attached");
            return false;
        }
        self.live().set_use_cache(enabled);
        self.is_running()
    }

    /// Start recording a measurement per response, dropping earlier ones.
    fn measure_responses(&self) {
        self.live().measurements().enable();
    }

    fn unmeasure_responses(&self) {
        self.live().measurements().disable();
    }

    /// Recorded measurements; `None` while measuring is off.
    fn responses_data(&self) -> Option<Vec<MeasurementRecord>> {
        self.live().measurements().snapshot()
    }
}
