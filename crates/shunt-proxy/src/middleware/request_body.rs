use super::{Flow, Middleware};
use crate::error::ProxyError;
use crate::proxy::RequestContext;
use async_trait::async_trait;

/// Buffers the client request body so it can be fingerprinted and resent on
/// reconnect.
pub struct RequestBodyMiddleware;

#[async_trait]
impl Middleware for RequestBodyMiddleware {
    fn name(&self) -> &'static str {
        "request-body"
    }

    async fn handle(&self, ctx: &mut RequestContext) -> Result<Flow, ProxyError> {
        ctx.materialize_body().await?;
        Ok(Flow::Continue)
    }
}
