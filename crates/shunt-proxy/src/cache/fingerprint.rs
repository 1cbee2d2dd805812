//! Request fingerprints used as cache keys.

use hyper::Method;
use sha2::{Digest, Sha256};

/// Hex SHA-256 of `METHOD \n URL \n BODY`.
///
/// Neither a method nor a URL can contain a raw newline, so the separators
/// keep distinct requests apart.
pub fn fingerprint(method: &Method, url: &str, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(url.as_bytes());
    hasher.update(b"\n");
    hasher.update(body);
    hex::encode(hasher.finalize())
}
