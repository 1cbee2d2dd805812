use super::{Flow, Middleware, ResponseLayer};
use crate::error::ProxyError;
use crate::proxy::response_ext::boxed;
use crate::proxy::{ProxyBody, RequestContext};
use crate::throttle::{Throttle, ThrottledBody};
use async_trait::async_trait;

/// Applies the exchange's speed snapshot to both directions.
///
/// Without a configured rate the direction is left untouched.
pub struct SpeedMiddleware;

#[async_trait]
impl Middleware for SpeedMiddleware {
    fn name(&self) -> &'static str {
        "speed"
    }

    async fn handle(&self, ctx: &mut RequestContext) -> Result<Flow, ProxyError> {
        if let Some(rate) = ctx.settings.request_speed {
            ctx.upload_throttle = Some(Throttle::from_rate(rate));
        }
        if let Some(rate) = ctx.settings.response_speed {
            ctx.push_layer(Box::new(ThrottleLayer(Throttle::from_rate(rate))));
        }
        Ok(Flow::Continue)
    }
}

struct ThrottleLayer(Throttle);

impl ResponseLayer for ThrottleLayer {
    fn wrap(self: Box<Self>, _ctx: &RequestContext, body: ProxyBody) -> ProxyBody {
        boxed(ThrottledBody::new(body, self.0))
    }
}
