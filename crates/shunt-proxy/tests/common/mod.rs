//! Local upstream servers shared by the integration tests.

#![allow(dead_code)]

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::ServerConfig;
use shunt_proxy::config::CacheConfig;
use shunt_proxy::{CacheRules, CertificateAuthority, ResponseCache};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

/// Size of the `/big` response body
pub const BIG_BODY_LEN: usize = 2048;

/// Test upstream answering a fixed set of routes:
///
/// - `/hello` 200 `hello world`
/// - `/echo` 200 `<METHOD> <body>`
/// - `/missing` 404
/// - `/empty` 200 with no body
/// - `/big` 200 with `BIG_BODY_LEN` bytes
/// - `/inspect` 200 listing the `host` header and whether `proxy-connection` arrived
pub struct Upstream {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl Upstream {
    pub async fn start() -> Self {
        Self::spawn(None).await
    }

    /// Upstream speaking HTTPS with a certificate for `localhost`.
    pub async fn start_tls(config: Arc<ServerConfig>) -> Self {
        Self::spawn(Some(TlsAcceptor::from(config))).await
    }

    async fn spawn(tls: Option<TlsAcceptor>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let counter = counter.clone();
                let tls = tls.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        route(req)
                    });
                    match tls {
                        Some(acceptor) => {
                            if let Ok(stream) = acceptor.accept(stream).await {
                                let _ = http1::Builder::new()
                                    .serve_connection(TokioIo::new(stream), service)
                                    .await;
                            }
                        }
                        None => {
                            let _ = http1::Builder::new()
                                .serve_connection(TokioIo::new(stream), service)
                                .await;
                        }
                    }
                });
            }
        });

        Self { addr, hits, task }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Requests received so far.
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl Drop for Upstream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn route(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let host = req
        .headers()
        .get("host")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let proxy_connection = req.headers().contains_key("proxy-connection");
    let body = req.into_body().collect().await.map(|b| b.to_bytes()).unwrap_or_default();

    let (status, body) = match path.as_str() {
        "/hello" => (StatusCode::OK, Bytes::from_static(b"hello world")),
        "/echo" => (
            StatusCode::OK,
            Bytes::from(format!("{} {}", method, String::from_utf8_lossy(&body))),
        ),
        "/missing" => (StatusCode::NOT_FOUND, Bytes::from_static(b"not found")),
        "/empty" => (StatusCode::OK, Bytes::new()),
        "/big" => (StatusCode::OK, Bytes::from(vec![b'x'; BIG_BODY_LEN])),
        "/inspect" => (
            StatusCode::OK,
            Bytes::from(format!("host={host};proxy-connection={proxy_connection}")),
        ),
        _ => (StatusCode::NOT_FOUND, Bytes::new()),
    };

    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert("x-upstream", "shunt-test".parse().unwrap());
    Ok(response)
}

/// Upstream that accepts connections and drops them without answering.
pub struct FlakyUpstream {
    pub addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl FlakyUpstream {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));

        let counter = connections.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                drop(stream);
            }
        });

        Self {
            addr,
            connections,
            task,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

impl Drop for FlakyUpstream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// TLS configuration for an upstream at `localhost`, signed by a throwaway CA.
pub async fn localhost_tls(dir: &Path) -> Arc<ServerConfig> {
    let ca = CertificateAuthority::load_or_generate(dir).await.unwrap();
    ca.server_config_for("localhost").unwrap()
}

/// HTTP client that ignores proxy settings from the environment.
pub fn direct_client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

pub fn response_cache(folder: &Path) -> Arc<ResponseCache> {
    let config = CacheConfig {
        enabled: true,
        folder: folder.to_path_buf(),
        ..Default::default()
    };
    Arc::new(ResponseCache::new(&config, CacheRules::default()))
}

/// Wait until `folder` holds `count` cache entries.
pub async fn wait_for_entries(folder: &Path, count: usize) {
    for _ in 0..100 {
        let entries = std::fs::read_dir(folder)
            .map(|dir| {
                dir.filter_map(Result::ok)
                    .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
                    .count()
            })
            .unwrap_or(0);
        if entries >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("cache never reached {count} entries");
}
