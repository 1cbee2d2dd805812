//! Proxy servers.
//!
//! - `forward` - relays every request to one fixed target
//! - `intercept` - HTTP proxy terminating CONNECT tunnels with the local CA
//! - `engine` - exchange handling shared by both modes
//! - `lifecycle` - start/stop of the listeners
//! - `client` - pooled upstream HTTP client
//! - `tls` - rustls setup

mod client;
pub mod context;
mod control;
mod engine;
mod forward;
pub mod headers;
mod intercept;
mod lifecycle;
pub mod liveness;
pub(crate) mod network;
pub mod response_ext;
pub mod retry;
mod settings;
pub mod tls;

pub use client::{create_http_client, HttpClient};
pub use context::{ExchangeSettings, RequestContext};
pub use control::{ProxyControl, ProxyOptions};
pub use forward::ForwardProxy;
pub use intercept::InterceptingProxy;
pub use lifecycle::ProxyState;
pub use liveness::ClientLiveness;
pub use response_ext::{BoxError, ProxyBody};
pub use retry::{RetryDecision, RetryPolicy};
pub use settings::{LiveSettings, SpeedLimit, SpeedSetting};
