//! Exchange handling shared by both proxy modes.
//!
//! An exchange is built from the client request, run through the middleware
//! pipeline and, unless a middleware answered it, forwarded upstream with
//! reconnects. The response body leaves through the layers the middleware
//! registered.

use super::client::HttpClient;
use super::context::RequestContext;
use super::headers::strip_hop_by_hop;
use super::liveness::ClientLiveness;
use super::response_ext::{boxed, full, ProxyBody};
use super::retry::{RetryDecision, RetryPolicy};
use super::settings::LiveSettings;
use crate::error::ProxyError;
use crate::metrics;
use crate::middleware::{Flow, Pipeline};
use crate::throttle::ThrottledBody;
use hyper::body::Incoming;
use hyper::header::HOST;
use hyper::{Request, Response, Uri};
use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

pub(crate) struct Engine {
    /// Label used in logs and metrics ("forward" or "intercept")
    kind: &'static str,
    client: HttpClient,
    pipeline: Pipeline,
    timeout: Duration,
    retry: RetryPolicy,
    live: Arc<LiveSettings>,
}

impl Engine {
    pub(crate) fn new(
        kind: &'static str,
        client: HttpClient,
        pipeline: Pipeline,
        timeout: Duration,
        live: Arc<LiveSettings>,
    ) -> Self {
        Self {
            kind,
            client,
            pipeline,
            timeout,
            retry: RetryPolicy,
            live,
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        self.kind
    }

    /// Handle one client request whose upstream target is `upstream`.
    ///
    /// An `Err` makes hyper drop the client connection without a response.
    pub(crate) async fn handle(
        &self,
        req: Request<Incoming>,
        upstream: Uri,
        client: &ClientLiveness,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let (parts, body) = req.into_parts();
        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        // The upstream client derives Host from the target URI
        headers.remove(HOST);

        let mut ctx = RequestContext::new(
            parts.method,
            upstream,
            headers,
            boxed(body),
            self.live.snapshot(),
            self.live.measurements().clone(),
        );

        let (response, outcome) = match self.pipeline.run(&mut ctx).await {
            Ok(Flow::Respond(response)) => (response, "replayed"),
            Ok(Flow::Continue) => match self.forward(&mut ctx, client).await {
                Ok(response) => (response, "forwarded"),
                Err(e) => {
                    metrics::record_exchange(self.kind, "failed", elapsed_ms(&ctx));
                    return Err(e);
                }
            },
            Err(e) => {
                error!("[{}] {}: {}", self.kind, ctx.key(), e);
                metrics::record_exchange(self.kind, "failed", elapsed_ms(&ctx));
                return Err(e);
            }
        };

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        ctx.record_response_head(parts.status, &parts.headers);
        debug!("[{}] {} -> {}", self.kind, ctx.key(), parts.status);
        metrics::record_exchange(self.kind, outcome, elapsed_ms(&ctx));

        let body = ctx.wrap_response_body(body);
        Ok(Response::from_parts(parts, body))
    }

    /// Send the request upstream, reconnecting while the retry policy allows.
    async fn forward(
        &self,
        ctx: &mut RequestContext,
        client: &ClientLiveness,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let body = ctx.materialize_body().await?;
        loop {
            let upload = match ctx.upload_throttle {
                Some(throttle) if !body.is_empty() => {
                    boxed(ThrottledBody::new(full(body.clone()), throttle))
                }
                _ => full(body.clone()),
            };
            let mut request = Request::new(upload);
            *request.method_mut() = ctx.method.clone();
            *request.uri_mut() = ctx.uri.clone();
            *request.headers_mut() = ctx.headers.clone();

            let err = match tokio::time::timeout(self.timeout, self.client.request(request)).await {
                Ok(Ok(response)) => return Ok(response.map(boxed)),
                Ok(Err(e)) => ProxyError::Upstream(ctx.url(), error_chain(&e)),
                Err(_) => ProxyError::UpstreamTimeout(ctx.url(), self.timeout.as_millis() as u64),
            };

            match self.retry.on_upstream_error(ctx, client) {
                RetryDecision::Retry => {
                    warn!(
                        "[{}] Request reconnected {} ({} left): {}",
                        self.kind,
                        ctx.key(),
                        ctx.remaining_reconnects,
                        err
                    );
                    metrics::record_reconnect(self.kind);
                }
                RetryDecision::GiveUp => {
                    error!("[{}] {}", self.kind, err);
                    metrics::record_upstream_failure(self.kind);
                    return Err(err);
                }
            }
        }
    }
}

fn elapsed_ms(ctx: &RequestContext) -> f64 {
    ctx.started.elapsed().as_secs_f64() * 1000.0
}

/// Join an error with its sources; the client error alone only names the
/// failure category.
fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
