use super::{Flow, Middleware};
use crate::cache::{fingerprint, CacheEntry, CaptureLayer, ResponseCache, StoredHeader};
use crate::error::{CacheError, ProxyError};
use crate::metrics;
use crate::proxy::response_ext::full;
use crate::proxy::{ProxyBody, RequestContext};
use async_trait::async_trait;
use hyper::{Response, StatusCode};
use std::sync::Arc;
use tracing::{debug, warn};

/// Replays cached responses and captures forwarded ones.
///
/// Active only for exchanges created while the proxy's cache flag is on.
pub struct CacheMiddleware {
    cache: Arc<ResponseCache>,
}

impl CacheMiddleware {
    pub fn new(cache: Arc<ResponseCache>) -> Self {
        Self { cache }
    }
}

fn replay(entry: CacheEntry) -> Result<Response<ProxyBody>, ProxyError> {
    let status = StatusCode::from_u16(entry.status)
        .map_err(|e| CacheError::Corrupt(entry.request.clone(), e.to_string()))?;
    let mut response = Response::new(full(entry.body));
    *response.status_mut() = status;
    *response.headers_mut() = StoredHeader::to_map(&entry.headers);
    Ok(response)
}

#[async_trait]
impl Middleware for CacheMiddleware {
    fn name(&self) -> &'static str {
        "cache"
    }

    async fn handle(&self, ctx: &mut RequestContext) -> Result<Flow, ProxyError> {
        if !ctx.settings.use_cache || self.cache.rules().skips_request(ctx) {
            return Ok(Flow::Continue);
        }

        let body = ctx.materialize_body().await?;
        let key = fingerprint(&ctx.method, &ctx.url(), &body);

        match self.cache.lookup(&key).await {
            Ok(Some(entry)) => match replay(entry) {
                Ok(response) => {
                    metrics::record_cache_lookup("hit");
                    debug!("[cache] <<<< {}", ctx.key());
                    return Ok(Flow::Respond(response));
                }
                Err(e) => {
                    metrics::record_cache_lookup("error");
                    warn!("Can't replay cached {}: {}", ctx.key(), e);
                }
            },
            Ok(None) => {
                metrics::record_cache_lookup("miss");
                ctx.push_layer(Box::new(CaptureLayer::new(self.cache.clone(), key)));
            }
            Err(e) => {
                metrics::record_cache_lookup("error");
                warn!("Cache lookup failed for {}: {}", ctx.key(), e);
            }
        }
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheRules;
    use crate::config::CacheConfig;
    use crate::proxy::context::tests::context;
    use chrono::Utc;
    use http_body_util::BodyExt;
    use hyper::Method;

    fn cache(folder: &std::path::Path, rules: CacheRules) -> Arc<ResponseCache> {
        let config = CacheConfig {
            enabled: true,
            folder: folder.to_path_buf(),
            ..Default::default()
        };
        Arc::new(ResponseCache::new(&config, rules))
    }

    #[tokio::test]
    async fn test_disabled_flag_skips_cache() {
        let dir = tempfile::tempdir().unwrap();
        let middleware = CacheMiddleware::new(cache(dir.path(), CacheRules::default()));

        let mut ctx = context(Method::GET, "http://app.test/", "");
        assert!(matches!(middleware.handle(&mut ctx).await.unwrap(), Flow::Continue));
        assert!(ctx.body().is_none());
    }

    #[tokio::test]
    async fn test_hit_replays_stored_response() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), CacheRules::default());
        let key = fingerprint(&Method::POST, "http://app.test/search", b"q=rust");
        cache
            .store(
                &key,
                CacheEntry {
                    request: "POST http://app.test/search".to_string(),
                    status: 200,
                    headers: vec![
                        StoredHeader::new("set-cookie", "a=1"),
                        StoredHeader::new("set-cookie", "b=2"),
                    ],
                    body: b"results".to_vec(),
                    stored_at: Utc::now(),
                },
            )
            .await
            .unwrap();

        let middleware = CacheMiddleware::new(cache);
        let mut ctx = context(Method::POST, "http://app.test/search", "q=rust");
        ctx.settings.use_cache = true;

        let Flow::Respond(response) = middleware.handle(&mut ctx).await.unwrap() else {
            panic!("expected a cache hit");
        };
        assert_eq!(response.status(), StatusCode::OK);
        let cookies: Vec<_> = response.headers().get_all("set-cookie").iter().collect();
        assert_eq!(cookies, vec!["a=1", "b=2"]);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.as_ref(), b"results");
    }

    #[tokio::test]
    async fn test_miss_continues() {
        let dir = tempfile::tempdir().unwrap();
        let middleware = CacheMiddleware::new(cache(dir.path(), CacheRules::default()));

        let mut ctx = context(Method::GET, "http://app.test/new", "");
        ctx.settings.use_cache = true;
        assert!(matches!(middleware.handle(&mut ctx).await.unwrap(), Flow::Continue));
        assert!(ctx.body().is_some());
    }

    #[tokio::test]
    async fn test_skip_request_predicate() {
        let dir = tempfile::tempdir().unwrap();
        let rules = CacheRules::default().skip_request(|ctx| ctx.method == Method::POST);
        let middleware = CacheMiddleware::new(cache(dir.path(), rules));

        let mut ctx = context(Method::POST, "http://app.test/", "x");
        ctx.settings.use_cache = true;
        assert!(matches!(middleware.handle(&mut ctx).await.unwrap(), Flow::Continue));
        assert!(ctx.body().is_none());
    }

    #[tokio::test]
    async fn test_lookup_error_falls_through() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), CacheRules::default());
        cache.ready().await.unwrap();
        let key = fingerprint(&Method::GET, "http://app.test/broken", b"");
        std::fs::write(dir.path().join(format!("{key}.json")), b"garbage").unwrap();

        let middleware = CacheMiddleware::new(cache);
        let mut ctx = context(Method::GET, "http://app.test/broken", "");
        ctx.settings.use_cache = true;
        assert!(matches!(middleware.handle(&mut ctx).await.unwrap(), Flow::Continue));
    }
}
