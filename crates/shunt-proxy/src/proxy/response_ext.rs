//! Body types shared by the proxies and their middleware.

use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Body, Bytes};
use std::convert::Infallible;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type of every request and response passing through a proxy.
pub type ProxyBody = BoxBody<Bytes, BoxError>;

/// Box any body whose error converts into [`BoxError`].
pub fn boxed<B>(body: B) -> ProxyBody
where
    B: Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<BoxError>,
{
    BoxBody::new(body.map_err(Into::into))
}

pub fn full(bytes: impl Into<Bytes>) -> ProxyBody {
    BoxBody::new(Full::new(bytes.into()).map_err(|never: Infallible| match never {}))
}

pub fn empty() -> ProxyBody {
    BoxBody::new(Empty::<Bytes>::new().map_err(|never: Infallible| match never {}))
}
