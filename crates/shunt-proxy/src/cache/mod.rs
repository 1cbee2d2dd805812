//! Disk-backed response cache.
//!
//! The cache is initialized once per process through a shared future; every
//! lookup and store waits on it, so concurrent callers racing the first
//! initialization all observe the same outcome. Forcing a new initialization
//! replaces the future, which is how the cache is cleared.

mod capture;
mod fingerprint;
mod store;

pub use capture::CaptureLayer;
pub use fingerprint::fingerprint;
pub use store::{CacheEntry, DiskStore, StoreOptions, StoredHeader};

use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::proxy::RequestContext;
use futures::future::{BoxFuture, FutureExt, Shared};
use hyper::{HeaderMap, StatusCode};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

pub type RequestPredicate = Arc<dyn Fn(&RequestContext) -> bool + Send + Sync>;
pub type ResponsePredicate = Arc<dyn Fn(StatusCode, &HeaderMap) -> bool + Send + Sync>;

/// Predicates excluding exchanges from caching. Any match skips the exchange.
#[derive(Clone, Default)]
pub struct CacheRules {
    pub skip_request: Vec<RequestPredicate>,
    pub skip_response: Vec<ResponsePredicate>,
}

impl CacheRules {
    pub fn skip_request(
        mut self,
        predicate: impl Fn(&RequestContext) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.skip_request.push(Arc::new(predicate));
        self
    }

    pub fn skip_response(
        mut self,
        predicate: impl Fn(StatusCode, &HeaderMap) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.skip_response.push(Arc::new(predicate));
        self
    }

    pub fn skips_request(&self, ctx: &RequestContext) -> bool {
        self.skip_request.iter().any(|skip| skip(ctx))
    }

    pub fn skips_response(&self, status: StatusCode, headers: &HeaderMap) -> bool {
        self.skip_response.iter().any(|skip| skip(status, headers))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InitOptions {
    /// Reinitialize even if initialization already happened
    pub force: bool,
    /// Keep entries from earlier runs instead of wiping the folder
    pub use_existing: bool,
}

type InitFuture = Shared<BoxFuture<'static, Result<Arc<DiskStore>, CacheError>>>;

pub struct ResponseCache {
    store_options: StoreOptions,
    use_existing: bool,
    rules: CacheRules,
    init: Mutex<Option<InitFuture>>,
}

impl ResponseCache {
    pub fn new(config: &CacheConfig, rules: CacheRules) -> Self {
        Self {
            store_options: StoreOptions {
                folder: config.folder.clone(),
                ttl: config.ttl(),
                max_size: config.max_size_bytes,
            },
            use_existing: config.use_existing,
            rules,
            init: Mutex::new(None),
        }
    }

    pub fn rules(&self) -> &CacheRules {
        &self.rules
    }

    /// Options used when the cache initializes itself on first use.
    pub fn default_init_options(&self) -> InitOptions {
        InitOptions {
            force: false,
            use_existing: self.use_existing,
        }
    }

    /// Initialize the backing store.
    ///
    /// Returns the in-flight or completed initialization unless `force` is
    /// set. The work runs when the returned future is first awaited.
    pub fn init(
        &self,
        options: InitOptions,
    ) -> impl std::future::Future<Output = Result<Arc<DiskStore>, CacheError>> {
        let mut init = self.init.lock();
        if !options.force {
            if let Some(existing) = init.as_ref() {
                return existing.clone();
            }
        }

        let store_options = self.store_options.clone();
        let use_existing = options.use_existing;
        let future: InitFuture = async move {
            let folder = store_options.folder.clone();
            let opened =
                tokio::task::spawn_blocking(move || DiskStore::open(store_options, use_existing))
                    .await;
            let store = opened.map_err(|e| CacheError::Io {
                path: folder.display().to_string(),
                message: e.to_string(),
            })??;
            info!("Response cache ready in {:?}", store.folder());
            Ok(Arc::new(store))
        }
        .boxed()
        .shared();

        *init = Some(future.clone());
        future
    }

    /// Wait for the store, starting the default initialization if needed.
    pub async fn ready(&self) -> Result<Arc<DiskStore>, CacheError> {
        self.init(self.default_init_options()).await
    }

    /// Drop every entry by reinitializing over a wiped folder.
    pub async fn clear(&self) -> Result<(), CacheError> {
        self.init(InitOptions {
            force: true,
            use_existing: false,
        })
        .await
        .map(|_| ())
    }

    pub async fn lookup(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let store = self.ready().await?;
        let key = key.to_string();
        tokio::task::spawn_blocking(move || store.get(&key))
            .await
            .map_err(|e| CacheError::Io {
                path: "lookup".to_string(),
                message: e.to_string(),
            })?
    }

    pub async fn store(&self, key: &str, entry: CacheEntry) -> Result<(), CacheError> {
        let store = self.ready().await?;
        let key = key.to_string();
        tokio::task::spawn_blocking(move || store.put(&key, &entry))
            .await
            .map_err(|e| CacheError::Io {
                path: "store".to_string(),
                message: e.to_string(),
            })?
    }
}
