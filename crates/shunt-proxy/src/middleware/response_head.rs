use super::{Flow, Middleware};
use crate::error::ProxyError;
use crate::proxy::RequestContext;
use async_trait::async_trait;

/// Makes the response status and headers available on the context for the
/// layers that follow.
pub struct ResponseHeadMiddleware;

#[async_trait]
impl Middleware for ResponseHeadMiddleware {
    fn name(&self) -> &'static str {
        "response-head"
    }

    async fn handle(&self, ctx: &mut RequestContext) -> Result<Flow, ProxyError> {
        ctx.capture_response_head = true;
        Ok(Flow::Continue)
    }
}
