//! Intercepting proxy: a regular HTTP proxy that also terminates CONNECT
//! tunnels.
//!
//! Plain requests arrive in absolute form and are handled directly. For a
//! CONNECT the proxy answers 200, then looks at the first byte the client
//! sends through the tunnel. A TLS handshake is terminated with a
//! certificate for the requested host signed by the local CA; anything else
//! is served as plain HTTP. Either way the tunneled requests run through the
//! same exchange engine as plain ones.

use super::client::create_http_client;
use super::control::{ProxyControl, ProxyOptions};
use super::engine::Engine;
use super::lifecycle::{Lifecycle, ProxyState};
use super::liveness::TrackedIo;
use super::response_ext::{empty, full, ProxyBody};
use super::settings::LiveSettings;
use crate::ca::CertificateAuthority;
use crate::cache::ResponseCache;
use crate::error::ProxyError;
use crate::middleware::Pipeline;
use async_trait::async_trait;
use hyper::body::Incoming;
use hyper::header::HOST;
use hyper::http::uri::Authority;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use rustls::server::Acceptor;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, warn};

/// First byte of a TLS handshake record
const TLS_HANDSHAKE: u8 = 0x16;

struct InterceptInner {
    engine: Engine,
    ca: RwLock<Option<Arc<CertificateAuthority>>>,
}

impl InterceptInner {
    fn ca(&self) -> Result<Arc<CertificateAuthority>, ProxyError> {
        self.ca
            .read()
            .clone()
            .ok_or_else(|| ProxyError::Certificate("certificate authority not loaded".to_string()))
    }

    fn open_tunnel(self: Arc<Self>, req: Request<Incoming>) -> Response<ProxyBody> {
        let Some(authority) = req.uri().authority().cloned() else {
            warn!("CONNECT without a target: {}", req.uri());
            let mut response = Response::new(full("CONNECT target must be host:port"));
            *response.status_mut() = StatusCode::BAD_REQUEST;
            return response;
        };

        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    if let Err(e) = self.serve_tunnel(upgraded, &authority).await {
                        debug!("Tunnel to {} ended: {}", authority, e);
                    }
                }
                Err(e) => debug!("CONNECT upgrade to {} failed: {}", authority, e),
            }
        });
        Response::new(empty())
    }

    async fn serve_tunnel(
        self: Arc<Self>,
        upgraded: Upgraded,
        authority: &Authority,
    ) -> Result<(), ProxyError> {
        let mut io = BufReader::new(TokioIo::new(upgraded));
        let first = io.fill_buf().await?.first().copied();
        match first {
            // Client closed the tunnel without sending anything
            None => Ok(()),
            Some(TLS_HANDSHAKE) => {
                let start = LazyConfigAcceptor::new(Acceptor::default(), io).await?;
                let host = start
                    .client_hello()
                    .server_name()
                    .map(str::to_string)
                    .unwrap_or_else(|| authority.host().to_string());
                let config = self.ca()?.server_config_for(&host)?;
                let tls = start.into_stream(config).await?;
                self.serve_tunneled(tls, "https", authority).await;
                Ok(())
            }
            Some(_) => {
                self.serve_tunneled(io, "http", authority).await;
                Ok(())
            }
        }
    }

    async fn serve_tunneled<T>(
        self: Arc<Self>,
        stream: T,
        scheme: &'static str,
        authority: &Authority,
    ) where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (io, client) = TrackedIo::new(stream);
        let fallback = authority.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            let inner = self.clone();
            let client = client.clone();
            let fallback = fallback.clone();
            async move {
                let upstream = request_target(&req, scheme, Some(&fallback))?;
                inner.engine.handle(req, upstream, &client).await
            }
        });

        if let Err(e) = http1::Builder::new()
            .serve_connection(TokioIo::new(io), service)
            .await
        {
            debug!("Tunneled {} connection to {} ended: {}", scheme, authority, e);
        }
    }
}

/// Upstream URI of a proxied request.
///
/// Absolute-form targets are used as they are. Origin-form targets take the
/// host from the Host header, then from `fallback`.
fn request_target<B>(
    req: &Request<B>,
    scheme: &str,
    fallback: Option<&Authority>,
) -> Result<Uri, ProxyError> {
    let uri = req.uri();
    if uri.scheme().is_some() && uri.authority().is_some() {
        return Ok(uri.clone());
    }

    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| fallback.map(|a| a.to_string()))
        .ok_or_else(|| ProxyError::InvalidUrl(uri.to_string(), "missing host".to_string()))?;
    let path_and_query = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");

    let url = format!("{scheme}://{host}{path_and_query}");
    url.parse()
        .map_err(|e: hyper::http::uri::InvalidUri| ProxyError::InvalidUrl(url, e.to_string()))
}

pub struct InterceptingProxy {
    inner: Arc<InterceptInner>,
    live: Arc<LiveSettings>,
    cache: Option<Arc<ResponseCache>>,
    ca_dir: PathBuf,
    install_certificate: bool,
    bind: SocketAddr,
    lifecycle: Lifecycle,
}

impl InterceptingProxy {
    /// Create a stopped proxy keeping its certificate authority in `ca_dir`.
    pub fn new(ca_dir: impl Into<PathBuf>, options: ProxyOptions) -> Result<Self, ProxyError> {
        let live = Arc::new(LiveSettings::new(&options.settings, options.initial_use_cache()));
        let client = create_http_client(&options.pool, options.settings.tls_skip_verify)?;
        let engine = Engine::new(
            "intercept",
            client,
            Pipeline::standard(options.cache.clone()),
            Duration::from_millis(options.settings.timeout_ms),
            live.clone(),
        );

        Ok(Self {
            inner: Arc::new(InterceptInner {
                engine,
                ca: RwLock::new(None),
            }),
            live,
            cache: options.cache.clone(),
            ca_dir: ca_dir.into(),
            install_certificate: false,
            bind: options.bind_addr(),
            lifecycle: Lifecycle::new("Intercepting"),
        })
    }

    /// Install the CA as a trusted root on start. A failed installation
    /// fails the start.
    pub fn install_certificate(mut self, install: bool) -> Self {
        self.install_certificate = install;
        self
    }

    /// CA certificate to trust in clients. Exists once the proxy started.
    pub fn certificate_path(&self) -> PathBuf {
        self.ca_dir.join("certs").join("ca.pem")
    }

    pub fn ca_dir(&self) -> &Path {
        &self.ca_dir
    }

    /// Certificate authority, once loaded by the first start.
    pub fn certificate_authority(&self) -> Option<Arc<CertificateAuthority>> {
        self.inner.ca.read().clone()
    }
}

#[async_trait]
impl ProxyControl for InterceptingProxy {
    async fn start(&self) -> Result<bool, ProxyError> {
        let inner = self.inner.clone();
        let ca_dir = self.ca_dir.clone();
        let install = self.install_certificate;
        let cache = self.cache.clone();
        let prepare = async move {
            let ca = Arc::new(CertificateAuthority::load_or_generate(&ca_dir).await?);
            if install {
                ca.install().await?;
            }
            *inner.ca.write() = Some(ca);
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

async fn serve_connection(inner: Arc<InterceptInner>, stream: TcpStream, peer: SocketAddr) {
    let (io, client) = TrackedIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let inner = inner.clone();
        let client = client.clone();
        async move {
            if req.method() == Method::CONNECT {
                return Ok(inner.open_tunnel(req));
            }
            let upstream = request_target(&req, "http", None)?;
            inner.engine.handle(req, upstream, &client).await
        }
    });

    if let Err(e) = http1::Builder::new()
        .serve_connection(TokioIo::new(io), service)
        .with_upgrades()
        .await
    {
        debug!("Intercept connection from {} ended: {}", peer, e);
    }
}
