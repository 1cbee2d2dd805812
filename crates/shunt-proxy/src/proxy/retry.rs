//! Reconnect decisions after upstream failures.

use super::context::RequestContext;
use super::liveness::ClientLiveness;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Resend the same request upstream
    Retry,
    /// The failure is terminal for this exchange
    GiveUp,
}

/// Reconnect only while the exchange has attempts left and the client is
/// still waiting for the response.
///
/// The budget is seeded on the context when the exchange is created and is
/// never replenished, so `N` reconnects allow `N + 1` attempts in total.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPolicy;

impl RetryPolicy {
    pub fn on_upstream_error(
        &self,
        ctx: &mut RequestContext,
        client: &ClientLiveness,
    ) -> RetryDecision {
        if ctx.remaining_reconnects > 0 && client.is_open() {
            ctx.remaining_reconnects -= 1;
            RetryDecision::Retry
        } else {
            RetryDecision::GiveUp
        }
    }
}
