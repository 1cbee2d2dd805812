//! Shunt: HTTP/HTTPS proxies for browser tests.
//!
//! A [`ForwardProxy`] relays to one fixed target; an [`InterceptingProxy`]
//! serves as the browser's proxy and decrypts HTTPS with a local CA. Both
//! run every exchange through the same middleware pipeline: bandwidth
//! throttling, response measurement and a disk-backed response cache.

pub mod ca;
pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod middleware;
pub mod proxy;
pub mod throttle;

pub use ca::CertificateAuthority;
pub use cache::{CacheRules, InitOptions, ResponseCache};
pub use config::Config;
pub use error::{CacheError, ProxyError};
pub use middleware::MeasurementRecord;
pub use proxy::{
    ForwardProxy, InterceptingProxy, ProxyControl, ProxyOptions, ProxyState, SpeedLimit,
    SpeedSetting,
};

pub type Result<T> = std::result::Result<T, ProxyError>;
