use bytes::Bytes;
use http::{HeaderMap, StatusCode};

#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Result of a successful submission: provider task id plus the raw record.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmittedTask {
    pub task_id: String,
    pub task_data: Bytes,
}
