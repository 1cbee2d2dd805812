//! Forward proxy: relays every request to one fixed target.

use super::client::create_http_client;
use super::control::{ProxyControl, ProxyOptions};
use super::engine::Engine;
use super::lifecycle::{Lifecycle, ProxyState};
use super::liveness::TrackedIo;
use super::settings::LiveSettings;
use crate::cache::ResponseCache;
use crate::config::TargetUrl;
use crate::error::ProxyError;
use crate::middleware::Pipeline;
use async_trait::async_trait;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Uri};
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info};

struct ForwardInner {
    engine: Engine,
    target: RwLock<TargetUrl>,
}

impl ForwardInner {
    fn upstream_for(&self, uri: &Uri) -> Result<Uri, ProxyError> {
        let path_and_query = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
        let url = self.target.read().join(path_and_query);
        url.parse()
            .map_err(|e: hyper::http::uri::InvalidUri| ProxyError::InvalidUrl(url, e.to_string()))
    }
}

pub struct ForwardProxy {
    inner: Arc<ForwardInner>,
    live: Arc<LiveSettings>,
    cache: Option<Arc<ResponseCache>>,
    bind: SocketAddr,
    lifecycle: Lifecycle,
}

impl ForwardProxy {
    /// Create a stopped proxy relaying to `url`, which must be http or https.
    pub fn new(url: &str, options: ProxyOptions) -> Result<Self, ProxyError> {
        let target = TargetUrl::parse(url)?;
        let live = Arc::new(LiveSettings::new(&options.settings, options.initial_use_cache()));
        let client = create_http_client(&options.pool, options.settings.tls_skip_verify)?;
        let engine = Engine::new(
            "forward",
            client,
            Pipeline::standard(options.cache.clone()),
            Duration::from_millis(options.settings.timeout_ms),
            live.clone(),
        );

        Ok(Self {
            inner: Arc::new(ForwardInner {
                engine,
                target: RwLock::new(target),
            }),
            live,
            cache: options.cache.clone(),
            bind: options.bind_addr(),
            lifecycle: Lifecycle::new("Forward"),
        })
    }

    /// Current target URL.
    pub fn target(&self) -> String {
        self.inner.target.read().as_str().to_string()
    }

    /// Change the target for exchanges created from now on.
    ///
    /// An invalid URL leaves the current target in place.
    pub fn set_url(&self, url: &str) -> Result<(), ProxyError> {
        let target = TargetUrl::parse(url)?;
        info!("Forward proxy target set to {}", target);
        *self.inner.target.write() = target;
        Ok(())
    }
}

#[async_trait]
impl ProxyControl for ForwardProxy {
    async fn start(&self) -> Result<bool, ProxyError> {
        let cache = self.cache.clone();
        let prepare = async move {
            if let Some(cache) = cache {
                cache.init(cache.default_init_options()).await?;
            }
            Ok(())
        };

        let inner = self.inner.clone();
        self.lifecycle
            .start(self.bind, prepare, move |stream, peer| {
                tokio::spawn(serve_connection(inner.clone(), stream, peer));
            })
            .await
    }

    async fn stop(&self) -> bool {
        self.lifecycle.stop().await
    }

    fn state(&self) -> ProxyState {
        self.lifecycle.state()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.lifecycle.local_addr()
    }

    fn live(&self) -> &LiveSettings {
        &self.live
    }

    fn has_cache(&self) -> bool {
        self.cache.is_some()
    }
}

async fn serve_connection(inner: Arc<ForwardInner>, stream: TcpStream, peer: SocketAddr) {
    let (io, client) = TrackedIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let inner = inner.clone();
        let client = client.clone();
        async move {
            let upstream = inner.upstream_for(req.uri())?;
            inner.engine.handle(req, upstream, &client).await
        }
    });

    if let Err(e) = http1::Builder::new()
        .serve_connection(TokioIo::new(io), service)
        .await
    {
        debug!("Forward connection from {} ended: {}", peer, e);
    }
}
