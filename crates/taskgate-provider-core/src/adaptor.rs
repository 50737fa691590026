use async_trait::async_trait;

use taskgate_protocol::task::TaskInfo;

use crate::channel::ChannelContext;
use crate::error::{TaskError, TransportError};
use crate::request::{UpstreamRequest, ValidatedRequest};
use crate::response::{SubmittedTask, UpstreamResponse};

/// Capability set every asynchronous-task provider implements.
///
/// Building, sending and interpreting are separate steps so a transport failure
/// can be retried without re-deriving the request, and so translation can be
/// exercised without the network.
#[async_trait]
pub trait TaskAdaptor: Send + Sync {
    /// Bind per-channel credentials. No I/O; calling it twice with the same
    /// channel leaves the adaptor unchanged.
    fn initialize(&mut self, channel: &ChannelContext);

    /// Parse the caller body once and classify the action.
    fn validate_request(&self, body: &[u8]) -> Result<ValidatedRequest, TaskError>;

    fn build_request(&self, request: &ValidatedRequest) -> Result<UpstreamRequest, TaskError>;

    async fn do_request(&self, request: UpstreamRequest)
    -> Result<UpstreamResponse, TransportError>;

    fn parse_submit_response(&self, response: &UpstreamResponse)
    -> Result<SubmittedTask, TaskError>;

    async fn fetch_task(
        &self,
        base_url: &str,
        api_key: &str,
        task_id: &str,
    ) -> Result<UpstreamResponse, TransportError>;

    fn parse_task_result(&self, body: &[u8]) -> Result<TaskInfo, TaskError>;

    fn model_list(&self) -> &'static [&'static str];

    fn channel_name(&self) -> &'static str;
}
