use bytes::Bytes;
use http::{HeaderMap, Method};

use taskgate_protocol::task::VideoRequest;

/// Caller request after validation. Threaded by reference through the later
/// steps instead of being parsed again.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRequest {
    pub action: &'static str,
    pub request: VideoRequest,
}

#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}
