//! End-to-end tests of the intercepting proxy: plain HTTP proxying and
//! CONNECT tunnels carrying TLS or plain HTTP.

mod common;

use common::{localhost_tls, response_cache, wait_for_entries, Upstream};
use shunt_proxy::config::ProxySettings;
use shunt_proxy::{InterceptingProxy, ProxyControl, ProxyOptions};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

async fn started(ca_dir: &std::path::Path, options: ProxyOptions) -> InterceptingProxy {
    let proxy = InterceptingProxy::new(ca_dir, options).unwrap();
    assert!(proxy.start().await.unwrap());
    proxy
}

fn trusting_upstreams() -> ProxyOptions {
    ProxyOptions {
        settings: ProxySettings {
            tls_skip_verify: true,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Client sending everything through `proxy` and trusting its CA.
fn proxied_client(proxy: &InterceptingProxy) -> reqwest::Client {
    let ca = proxy.certificate_authority().unwrap();
    reqwest::Client::builder()
        .proxy(reqwest::Proxy::all(proxy.url().unwrap()).unwrap())
        .add_root_certificate(reqwest::Certificate::from_pem(ca.cert_pem().as_bytes()).unwrap())
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_start_generates_ca() {
    let dir = tempfile::tempdir().unwrap();
    let proxy = InterceptingProxy::new(dir.path(), ProxyOptions::default()).unwrap();
    assert!(!proxy.certificate_path().exists());

    assert!(proxy.start().await.unwrap());
    assert!(!proxy.start().await.unwrap());
    assert!(proxy.certificate_path().exists());
    assert!(dir.path().join("keys/ca.key").exists());

    assert!(proxy.stop().await);
    assert!(!proxy.stop().await);

    // The same CA is reused on restart
    let pem = std::fs::read_to_string(proxy.certificate_path()).unwrap();
    assert!(proxy.start().await.unwrap());
    assert_eq!(proxy.certificate_authority().unwrap().cert_pem(), pem);
    proxy.stop().await;
}

#[tokio::test]
async fn test_plain_http_through_proxy() {
    let upstream = Upstream::start().await;
    let dir = tempfile::tempdir().unwrap();
    let proxy = started(dir.path(), ProxyOptions::default()).await;

    let response = proxied_client(&proxy)
        .get(format!("{}/hello", upstream.url()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "hello world");
    assert_eq!(upstream.hits(), 1);

    proxy.stop().await;
}

#[tokio::test]
async fn test_https_is_intercepted() {
    let certs = tempfile::tempdir().unwrap();
    let upstream = Upstream::start_tls(localhost_tls(certs.path()).await).await;
    let dir = tempfile::tempdir().unwrap();
    let proxy = started(dir.path(), trusting_upstreams()).await;
    proxy.measure_responses();

    let url = format!("https://localhost:{}/hello", upstream.addr.port());
    let response = proxied_client(&proxy).get(&url).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "hello world");
    assert_eq!(upstream.hits(), 1);

    // The exchange ran through the pipeline with the decrypted URL
    let mut records = Vec::new();
    for _ in 0..50 {
        records = proxy.responses_data().unwrap();
        if !records.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(records.len(), 1);
    assert!(records[0].url.starts_with("https://localhost:"));
    assert_eq!(records[0].status, Some(200));

    proxy.stop().await;
}

#[tokio::test]
async fn test_https_replayed_from_cache() {
    let certs = tempfile::tempdir().unwrap();
    let upstream = Upstream::start_tls(localhost_tls(certs.path()).await).await;
    let dir = tempfile::tempdir().unwrap();
    let cache_dir = tempfile::tempdir().unwrap();
    let options = ProxyOptions {
        cache: Some(response_cache(cache_dir.path())),
        use_cache: true,
        ..trusting_upstreams()
    };
    let proxy = started(dir.path(), options).await;
    let client = proxied_client(&proxy);

    let url = format!("https://localhost:{}/hello", upstream.addr.port());
    assert_eq!(client.get(&url).send().await.unwrap().text().await.unwrap(), "hello world");
    wait_for_entries(cache_dir.path(), 1).await;
    assert_eq!(client.get(&url).send().await.unwrap().text().await.unwrap(), "hello world");
    assert_eq!(upstream.hits(), 1);

    proxy.stop().await;
}

#[tokio::test]
async fn test_plain_http_inside_connect_tunnel() {
    let upstream = Upstream::start().await;
    let dir = tempfile::tempdir().unwrap();
    let proxy = started(dir.path(), ProxyOptions::default()).await;

    let mut stream = TcpStream::connect(proxy.local_addr().unwrap()).await.unwrap();
    let target = upstream.addr.to_string();
    stream
        .write_all(format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n").as_bytes())
        .await
        .unwrap();

    let mut reader = BufReader::new(stream);
    let mut status_line = String::new();
    reader.read_line(&mut status_line).await.unwrap();
    assert!(status_line.starts_with("HTTP/1.1 200"), "{status_line}");
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        if line == "\r\n" {
            break;
        }
    }

    reader
        .write_all(b"GET /hello HTTP/1.1\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    reader.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.ends_with("hello world"), "{response}");
    assert_eq!(upstream.hits(), 1);

    proxy.stop().await;
}

#[tokio::test]
async fn test_unreachable_https_upstream_drops_client() {
    let dir = tempfile::tempdir().unwrap();
    let options = ProxyOptions {
        settings: ProxySettings {
            reconnect: 0,
            tls_skip_verify: true,
            ..Default::default()
        },
        ..Default::default()
    };
    let proxy = started(dir.path(), options).await;

    // Bind and release a port so nothing listens on it
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let result = proxied_client(&proxy)
        .get(format!("https://localhost:{port}/hello"))
        .send()
        .await;
    assert!(result.is_err());

    proxy.stop().await;
}
