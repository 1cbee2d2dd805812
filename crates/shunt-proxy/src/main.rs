use anyhow::Context;
use clap::Parser;
use shunt_proxy::config::{Config, ForwardConfig, InterceptConfig};
use shunt_proxy::{
    metrics, CacheRules, ForwardProxy, InterceptingProxy, ProxyControl, ProxyOptions,
    ResponseCache,
};
use std::fs::OpenOptions;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "shunt.yaml";

/// Shunt - HTTP/HTTPS proxies for browser tests
#[derive(Parser, Debug)]
#[command(name = "shunt-proxy")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file (default: shunt.yaml when present)
    #[arg(short, long, env = "SHUNT_CONFIG")]
    config: Option<PathBuf>,

    /// Target URL of the forward proxy
    #[arg(long)]
    url: Option<String>,

    /// Start the forward proxy
    #[arg(long)]
    http_proxy: bool,

    /// Forward proxy port (0 = random)
    #[arg(long)]
    proxy_port: Option<u16>,

    /// Start the intercepting proxy
    #[arg(long)]
    global_proxy: bool,

    /// Intercepting proxy port
    #[arg(long)]
    global_proxy_port: Option<u16>,

    /// Speed limit in kb/s for both directions
    #[arg(long)]
    speed: Option<f64>,

    /// Reconnect attempts after an upstream error
    #[arg(long)]
    reconnect: Option<u32>,

    /// Upstream response timeout in ms
    #[arg(long)]
    timeout: Option<u64>,

    /// Cache responses, starting from an empty cache
    #[arg(long)]
    cache: bool,

    /// Cache responses, keeping the entries of earlier runs
    #[arg(long)]
    existing_cache: bool,

    #[arg(long)]
    cache_folder: Option<PathBuf>,

    /// Install the CA certificate as a trusted root (Windows only)
    #[arg(long)]
    install_certificate: bool,

    /// Serve Prometheus metrics on this port
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Log level, overridden by RUST_LOG
    #[arg(long, default_value = "debug")]
    log_level: String,

    /// Write logs to this file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if self.http_proxy || self.url.is_some() || self.proxy_port.is_some() {
            let forward = config.forward.get_or_insert(ForwardConfig {
                url: None,
                port: 0,
            });
            if let Some(url) = &self.url {
                forward.url = Some(url.clone());
            }
            if let Some(port) = self.proxy_port {
                forward.port = port;
            }
        }

        if self.global_proxy || self.global_proxy_port.is_some() || self.install_certificate {
            let intercept = config.intercept.get_or_insert_with(InterceptConfig::default);
            if let Some(port) = self.global_proxy_port {
                intercept.port = port;
            }
            intercept.install_certificate |= self.install_certificate;
        }

        if self.speed.is_some() {
            config.proxy.speed = self.speed;
        }
        if let Some(reconnect) = self.reconnect {
            config.proxy.reconnect = reconnect;
        }
        if let Some(timeout) = self.timeout {
            config.proxy.timeout_ms = timeout;
        }

        config.cache.enabled |= self.cache;
        config.cache.use_existing |= self.existing_cache;
        if let Some(folder) = &self.cache_folder {
            config.cache.folder = folder.clone();
        }

        if self.metrics_port.is_some() {
            config.metrics.port = self.metrics_port;
        }
    }
}

fn init_logging(level: &str, log_file: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,shunt_proxy={level}")));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.init(),
    }
    Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::read(path)?,
        None if Path::new(DEFAULT_CONFIG).exists() => Config::read(DEFAULT_CONFIG)?,
        None => Config::default(),
    };
    args.apply(&mut config);
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level, args.log_file.as_deref())?;
    let config = load_config(&args)?;

    let cache = config
        .cache
        .is_enabled()
        .then(|| Arc::new(ResponseCache::new(&config.cache, CacheRules::default())));
    let options = |port| ProxyOptions {
        port,
        settings: config.proxy.clone(),
        pool: config.connection_pool.clone(),
        cache: cache.clone(),
        use_cache: config.cache.is_enabled(),
    };

    let mut proxies: Vec<Box<dyn ProxyControl>> = Vec::new();

    if let Some(forward) = &config.forward {
        let url = forward.url.as_deref().unwrap_or_default();
        let proxy = ForwardProxy::new(url, options(forward.port))?;
        proxy.start().await?;
        println!(
            "Forward proxy {} -> {}",
            proxy.url().unwrap_or_default(),
            proxy.target()
        );
        proxies.push(Box::new(proxy));
    }

    if let Some(intercept) = &config.intercept {
        let proxy = InterceptingProxy::new(&intercept.ca_dir, options(intercept.port))?
            .install_certificate(intercept.install_certificate);
        proxy.start().await?;
        println!(
            "Intercepting proxy {} (CA certificate: {})",
            proxy.url().unwrap_or_default(),
            proxy.certificate_path().display()
        );
        proxies.push(Box::new(proxy));
    }

    if let Some(port) = config.metrics.port {
        let addr = SocketAddr::new(config.proxy.bind_address, port);
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind metrics port {port}"))?;
        tokio::spawn(async move {
            if let Err(e) = metrics::serve(listener).await {
                error!("Metrics server failed: {}", e);
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    for proxy in &proxies {
        proxy.stop().await;
    }
    Ok(())
}
