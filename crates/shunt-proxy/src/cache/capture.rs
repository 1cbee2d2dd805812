//! Capture of forwarded responses into the cache.

use super::{CacheEntry, ResponseCache, StoredHeader};
use crate::metrics;
use crate::middleware::ResponseLayer;
use crate::proxy::response_ext::boxed;
use crate::proxy::{ProxyBody, RequestContext};
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use http_body::{Body, Frame, SizeHint};
use hyper::header::CONTENT_LENGTH;
use hyper::{HeaderMap, StatusCode};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Buffers the response body on its way to the client and stores it once the
/// body completes.
pub struct CaptureLayer {
    cache: Arc<ResponseCache>,
    fingerprint: String,
}

impl CaptureLayer {
    pub fn new(cache: Arc<ResponseCache>, fingerprint: String) -> Self {
        Self { cache, fingerprint }
    }
}

impl ResponseLayer for CaptureLayer {
    fn wrap(self: Box<Self>, ctx: &RequestContext, body: ProxyBody) -> ProxyBody {
        let (Some(status), Some(headers)) = (ctx.response_status, ctx.response_headers.clone())
        else {
            return body;
        };
        if status != StatusCode::OK || self.cache.rules().skips_response(status, &headers) {
            debug!("Not caching {} ({})", ctx.key(), status);
            return body;
        }
        boxed(CaptureBody {
            inner: body,
            buffer: BytesMut::new(),
            pending: Some(PendingStore {
                cache: self.cache,
                fingerprint: self.fingerprint,
                request: ctx.key(),
                status,
                headers,
            }),
            storing: None,
        })
    }
}

struct PendingStore {
    cache: Arc<ResponseCache>,
    fingerprint: String,
    request: String,
    status: StatusCode,
    headers: HeaderMap,
}

impl PendingStore {
    fn commit(self, body: Bytes) -> Option<JoinHandle<()>> {
        if body.is_empty() {
            debug!("Not caching {}: empty body", self.request);
            return None;
        }
        let declared = self
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());
        if declared.is_some_and(|len| len != body.len()) {
            warn!("Not caching {}: truncated body", self.request);
            return None;
        }

        let entry = CacheEntry {
            request: self.request.clone(),
            status: self.status.as_u16(),
            headers: StoredHeader::list(&self.headers),
            body: body.to_vec(),
            stored_at: Utc::now(),
        };
        let cache = self.cache;
        let fingerprint = self.fingerprint;
        let request = self.request;
        Some(tokio::spawn(async move {
            match cache.store(&fingerprint, entry).await {
                Ok(()) => {
                    metrics::record_cache_store();
                    debug!("[cache] >>>> {}", request);
                }
                Err(e) => warn!("Failed to cache {}: {}", request, e),
            }
        }))
    }
}

/// Passes frames through unchanged while keeping a copy of the data.
///
/// Nothing is stored when the body fails or is dropped before its end. The
/// end of the body is reported only after the entry is written, so a request
/// sent after a complete response finds it in the cache.
struct CaptureBody<B> {
    inner: B,
    buffer: BytesMut,
    pending: Option<PendingStore>,
    storing: Option<JoinHandle<()>>,
}

impl<B> CaptureBody<B> {
    fn finish(&mut self) {
        if let Some(pending) = self.pending.take() {
            self.storing = pending.commit(std::mem::take(&mut self.buffer).freeze());
        }
    }

    fn poll_stored(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if let Some(storing) = self.storing.as_mut() {
            // Store failures are logged by the task
            let _ = ready!(Pin::new(storing).poll(cx));
            self.storing = None;
        }
        Poll::Ready(())
    }
}

impl<B> Body for CaptureBody<B>
where
    B: Body<Data = Bytes> + Unpin,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if this.storing.is_some() {
            ready!(this.poll_stored(cx));
            return Poll::Ready(None);
        }
        let frame = ready!(Pin::new(&mut this.inner).poll_frame(cx));
        match &frame {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    if this.pending.is_some() {
                        this.buffer.extend_from_slice(data);
                    }
                }
                if this.inner.is_end_stream() {
                    this.finish();
                }
            }
            Some(Err(_)) => {
                this.pending = None;
                this.buffer.clear();
            }
            None => {
                this.finish();
                ready!(this.poll_stored(cx));
            }
        }
        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.storing.is_none() && self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{fingerprint, CacheRules};
    use crate::config::CacheConfig;
    use crate::proxy::context::tests::context;
    use crate::proxy::response_ext::full;
    use http_body_util::BodyExt;
    use hyper::Method;
    use std::time::Duration;

    fn cache(folder: &std::path::Path, rules: CacheRules) -> Arc<ResponseCache> {
        let config = CacheConfig {
            enabled: true,
            folder: folder.to_path_buf(),
            ..Default::default()
        };
        Arc::new(ResponseCache::new(&config, rules))
    }

    async fn run(
        cache: &Arc<ResponseCache>,
        status: StatusCode,
        headers: HeaderMap,
        body: &'static str,
    ) -> String {
        let mut ctx = context(Method::GET, "http://app.test/page", "");
        let key = fingerprint(&ctx.method, &ctx.url(), b"");
        ctx.capture_response_head = true;
        ctx.push_layer(Box::new(CaptureLayer::new(cache.clone(), key.clone())));
        ctx.record_response_head(status, &headers);

        let wrapped = ctx.wrap_response_body(full(body));
        let collected = wrapped.collect().await.unwrap().to_bytes();
        assert_eq!(collected, Bytes::from_static(body.as_bytes()));
        key
    }

    #[tokio::test]
    async fn test_ok_response_is_stored() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), CacheRules::default());
        let mut headers = HeaderMap::new();
        headers.insert("x-app", "1".parse().unwrap());

        let key = run(&cache, StatusCode::OK, headers, "hello").await;

        // Stored by the time the body has ended
        let entry = cache.lookup(&key).await.unwrap().unwrap();
        assert_eq!(entry.status, 200);
        assert_eq!(entry.body, b"hello");
        assert_eq!(entry.headers, vec![StoredHeader::new("x-app", "1")]);
    }

    #[tokio::test]
    async fn test_non_ok_and_empty_are_not_stored() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), CacheRules::default());

        let key = run(&cache, StatusCode::NOT_FOUND, HeaderMap::new(), "missing").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cache.lookup(&key).await.unwrap().is_none());

        let key = run(&cache, StatusCode::OK, HeaderMap::new(), "").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cache.lookup(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_skip_response_predicate() {
        let dir = tempfile::tempdir().unwrap();
        let rules =
            CacheRules::default().skip_response(|_, headers| headers.contains_key("x-no-cache"));
        let cache = cache(dir.path(), rules);
        let mut headers = HeaderMap::new();
        headers.insert("x-no-cache", "1".parse().unwrap());

        let key = run(&cache, StatusCode::OK, headers, "hello").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cache.lookup(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_body_is_not_stored() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), CacheRules::default());
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, "100".parse().unwrap());

        let key = run(&cache, StatusCode::OK, headers, "short").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cache.lookup(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dropped_body_is_not_stored() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), CacheRules::default());

        let mut ctx = context(Method::GET, "http://app.test/page", "");
        let key = fingerprint(&ctx.method, &ctx.url(), b"");
        ctx.capture_response_head = true;
        ctx.push_layer(Box::new(CaptureLayer::new(cache.clone(), key.clone())));
        ctx.record_response_head(StatusCode::OK, &HeaderMap::new());
        drop(ctx.wrap_response_body(full("never read")));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cache.lookup(&key).await.unwrap().is_none());
    }
}
