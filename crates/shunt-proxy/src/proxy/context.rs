//! Per-exchange state.

use super::response_ext::{BoxError, ProxyBody};
use crate::error::ProxyError;
use crate::middleware::measure::Measurements;
use crate::middleware::ResponseLayer;
use crate::throttle::Throttle;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::BodyExt;
use hyper::{HeaderMap, Method, StatusCode, Uri};
use std::time::Instant;

/// Live settings of a proxy instance, copied into each exchange on creation.
///
/// Changing a proxy's speed or cache flag affects exchanges created after
/// the change; exchanges in flight keep their snapshot.
#[derive(Clone, Debug, Default)]
pub struct ExchangeSettings {
    pub request_speed: Option<f64>,
    pub response_speed: Option<f64>,
    pub use_cache: bool,
    pub reconnect: u32,
}

/// State of a single exchange, owned by the task handling it.
pub struct RequestContext {
    pub method: Method,
    /// Resolved upstream URI
    pub uri: Uri,
    /// Request headers, hop-by-hop headers removed
    pub headers: HeaderMap,
    body: Option<Bytes>,
    incoming: Option<ProxyBody>,

    pub remaining_reconnects: u32,
    pub settings: ExchangeSettings,
    pub measurements: Measurements,

    /// Record the upstream status and headers once they arrive
    pub capture_response_head: bool,
    pub response_status: Option<StatusCode>,
    pub response_headers: Option<HeaderMap>,

    pub upload_throttle: Option<Throttle>,
    layers: Vec<Box<dyn ResponseLayer>>,

    pub started: Instant,
    pub started_at: DateTime<Utc>,
}

impl RequestContext {
    pub fn new(
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: ProxyBody,
        settings: ExchangeSettings,
        measurements: Measurements,
    ) -> Self {
        Self {
            method,
            uri,
            headers,
            body: None,
            incoming: Some(body),
            remaining_reconnects: settings.reconnect,
            settings,
            measurements,
            capture_response_head: false,
            response_status: None,
            response_headers: None,
            upload_throttle: None,
            layers: Vec::new(),
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    /// Full upstream URL of the request.
    pub fn url(&self) -> String {
        self.uri.to_string()
    }

    /// `METHOD url`, used in log lines.
    pub fn key(&self) -> String {
        format!("{} {}", self.method, self.uri)
    }

    /// Request body, once materialized.
    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// Read the whole client request body into memory.
    ///
    /// Later calls return the already buffered body.
    pub async fn materialize_body(&mut self) -> Result<Bytes, ProxyError> {
        if let Some(body) = &self.body {
            return Ok(body.clone());
        }
        let bytes = match self.incoming.take() {
            Some(incoming) => incoming
                .collect()
                .await
                .map_err(|e: BoxError| ProxyError::RequestBody(e.to_string()))?
                .to_bytes(),
            None => Bytes::new(),
        };
        self.body = Some(bytes.clone());
        Ok(bytes)
    }

    pub fn record_response_head(&mut self, status: StatusCode, headers: &HeaderMap) {
        if self.capture_response_head {
            self.response_status = Some(status);
            self.response_headers = Some(headers.clone());
        }
    }

    /// Register a wrapper for the response body. Layers apply in registration
    /// order, so the first registered layer sits closest to the upstream body.
    pub fn push_layer(&mut self, layer: Box<dyn ResponseLayer>) {
        self.layers.push(layer);
    }

    /// Run the response body through every registered layer.
    pub fn wrap_response_body(&mut self, mut body: ProxyBody) -> ProxyBody {
        for layer in std::mem::take(&mut self.layers) {
            body = layer.wrap(self, body);
        }
        body
    }
}
