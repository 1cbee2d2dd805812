//! Response measurement.
//!
//! While measurement is enabled on a proxy, every exchange appends one
//! [`MeasurementRecord`] when its response body is finished.

use super::{Flow, Middleware, ResponseLayer};
use crate::error::ProxyError;
use crate::proxy::headers::to_pairs;
use crate::proxy::response_ext::boxed;
use crate::proxy::{ProxyBody, RequestContext};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body::{Body, Frame, SizeHint};
use parking_lot::Mutex;
use serde::Serialize;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeasurementRecord {
    pub method: String,
    pub url: String,
    pub status: Option<u16>,
    pub headers: Vec<(String, String)>,
    pub size_bytes: u64,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

/// Measurement buffer of one proxy. `None` means measurement is disabled.
#[derive(Debug, Clone, Default)]
pub struct Measurements(Arc<Mutex<Option<Vec<MeasurementRecord>>>>);

impl Measurements {
    /// Start measuring with an empty buffer, dropping earlier records.
    pub fn enable(&self) {
        *self.0.lock() = Some(Vec::new());
    }

    pub fn disable(&self) {
        *self.0.lock() = None;
    }

    pub fn is_enabled(&self) -> bool {
        self.0.lock().is_some()
    }

    /// Copy of the collected records, or `None` while disabled.
    pub fn snapshot(&self) -> Option<Vec<MeasurementRecord>> {
        self.0.lock().clone()
    }

    fn push(&self, record: MeasurementRecord) {
        if let Some(records) = self.0.lock().as_mut() {
            records.push(record);
        }
    }
}

pub struct MeasureMiddleware;

#[async_trait]
impl Middleware for MeasureMiddleware {
    fn name(&self) -> &'static str {
        "measure"
    }

    async fn handle(&self, ctx: &mut RequestContext) -> Result<Flow, ProxyError> {
        if ctx.measurements.is_enabled() {
            ctx.push_layer(Box::new(MeasureLayer));
        }
        Ok(Flow::Continue)
    }
}

struct MeasureLayer;

impl ResponseLayer for MeasureLayer {
    fn wrap(self: Box<Self>, ctx: &RequestContext, body: ProxyBody) -> ProxyBody {
        let record = MeasurementRecord {
            method: ctx.method.to_string(),
            url: ctx.url(),
            status: ctx.response_status.map(|s| s.as_u16()),
            headers: ctx.response_headers.as_ref().map(to_pairs).unwrap_or_default(),
            size_bytes: 0,
            started_at: ctx.started_at,
            elapsed_ms: 0,
        };
        boxed(MeasuredBody {
            inner: body,
            pending: Some(PendingRecord {
                record,
                started: ctx.started,
                sink: ctx.measurements.clone(),
            }),
        })
    }
}

struct PendingRecord {
    record: MeasurementRecord,
    started: Instant,
    sink: Measurements,
}

/// Counts the bytes passing through and records the exchange when the body
/// ends or is dropped, whichever comes first.
struct MeasuredBody<B> {
    inner: B,
    pending: Option<PendingRecord>,
}

impl<B> MeasuredBody<B> {
    fn finish(&mut self) {
        if let Some(mut pending) = self.pending.take() {
            pending.record.elapsed_ms = pending.started.elapsed().as_millis() as u64;
            pending.sink.push(pending.record);
        }
    }
}

impl<B> Drop for MeasuredBody<B> {
    fn drop(&mut self) {
        self.finish();
    }
}

impl<B> Body for MeasuredBody<B>
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
        let frame = ready!(Pin::new(&mut this.inner).poll_frame(cx));
        match &frame {
            Some(Ok(frame)) => {
                if let (Some(data), Some(pending)) = (frame.data_ref(), this.pending.as_mut()) {
                    pending.record.size_bytes += data.len() as u64;
                }
                if this.inner.is_end_stream() {
                    this.finish();
                }
            }
            Some(Err(_)) | None => this.finish(),
        }
        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
