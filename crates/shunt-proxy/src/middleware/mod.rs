//! Middleware pipeline run before every exchange is forwarded.
//!
//! Handlers run strictly in registration order. The first one answering
//! [`Flow::Respond`] ends the pipeline and the exchange is never forwarded.
//! Handlers keep no per-exchange state of their own: everything lives in the
//! [`RequestContext`]. Handlers that need to see the response body register a
//! [`ResponseLayer`] on the context instead.

pub mod cache;
pub mod measure;
pub mod request_body;
pub mod response_head;
pub mod speed;

use crate::cache::ResponseCache;
use crate::error::ProxyError;
use crate::proxy::{ProxyBody, RequestContext};
use async_trait::async_trait;
use hyper::Response;
use std::sync::Arc;

pub use self::cache::CacheMiddleware;
pub use measure::{MeasureMiddleware, MeasurementRecord, Measurements};
pub use request_body::RequestBodyMiddleware;
pub use response_head::ResponseHeadMiddleware;
pub use speed::SpeedMiddleware;

/// Outcome of a middleware.
pub enum Flow {
    /// Hand the exchange to the next middleware, or upstream after the last.
    Continue,
    /// The exchange is answered; skip the rest of the pipeline and upstream.
    Respond(Response<ProxyBody>),
}

#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, ctx: &mut RequestContext) -> Result<Flow, ProxyError>;
}

/// Wrapper installed around the response body of one exchange.
pub trait ResponseLayer: Send {
    fn wrap(self: Box<Self>, ctx: &RequestContext, body: ProxyBody) -> ProxyBody;
}

/// Ordered, short-circuiting chain of middleware.
#[derive(Clone, Default)]
pub struct Pipeline {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Body materialization, response head capture, throttling, measurement
    /// and, when a cache is given, caching.
    pub fn standard(cache: Option<Arc<ResponseCache>>) -> Self {
        let pipeline = Self::new()
            .with(RequestBodyMiddleware)
            .with(ResponseHeadMiddleware)
            .with(SpeedMiddleware)
            .with(MeasureMiddleware);
        match cache {
            Some(cache) => pipeline.with(CacheMiddleware::new(cache)),
            None => pipeline,
        }
    }

    pub fn with(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.middlewares.iter().map(|m| m.name()).collect()
    }

    pub async fn run(&self, ctx: &mut RequestContext) -> Result<Flow, ProxyError> {
        for middleware in &self.middlewares {
            if let Flow::Respond(response) = middleware.handle(ctx).await? {
                tracing::trace!("{} answered {}", middleware.name(), ctx.key());
                return Ok(Flow::Respond(response));
            }
        }
        Ok(Flow::Continue)
    }
}
