pub mod doubao;

pub use doubao::{DoubaoAdaptor, DoubaoProtocol};

use async_trait::async_trait;

use taskgate_protocol::task::TaskInfo;
use taskgate_provider_core::{
    ChannelContext, ChannelType, SubmittedTask, TaskAdaptor, TaskError, TransportError,
    UpstreamRequest, UpstreamResponse, ValidatedRequest,
};

/// Every provider the gateway can relay to. New providers add a variant here
/// and a match arm in each delegating method.
#[derive(Debug, Clone)]
pub enum ChannelAdaptor {
    Doubao(DoubaoAdaptor),
}

impl ChannelAdaptor {
    pub fn for_channel(channel: &ChannelContext) -> Self {
        match channel.channel_type {
            ChannelType::Doubao => ChannelAdaptor::Doubao(DoubaoAdaptor::new(channel)),
        }
    }
}

#[async_trait]
impl TaskAdaptor for ChannelAdaptor {
    fn initialize(&mut self, channel: &ChannelContext) {
        match self {
            ChannelAdaptor::Doubao(adaptor) => adaptor.initialize(channel),
        }
    }

    fn validate_request(&self, body: &[u8]) -> Result<ValidatedRequest, TaskError> {
        match self {
            ChannelAdaptor::Doubao(adaptor) => adaptor.validate_request(body),
        }
    }

    fn build_request(&self, request: &ValidatedRequest) -> Result<UpstreamRequest, TaskError> {
        match self {
            ChannelAdaptor::Doubao(adaptor) => adaptor.build_request(request),
        }
    }

    async fn do_request(
        &self,
        request: UpstreamRequest,
    ) -> Result<UpstreamResponse, TransportError> {
        match self {
            ChannelAdaptor::Doubao(adaptor) => adaptor.do_request(request).await,
        }
    }

    fn parse_submit_response(
        &self,
        response: &UpstreamResponse,
    ) -> Result<SubmittedTask, TaskError> {
        match self {
            ChannelAdaptor::Doubao(adaptor) => adaptor.parse_submit_response(response),
        }
    }

    async fn fetch_task(
        &self,
        base_url: &str,
        api_key: &str,
        task_id: &str,
    ) -> Result<UpstreamResponse, TransportError> {
        match self {
            ChannelAdaptor::Doubao(adaptor) => adaptor.fetch_task(base_url, api_key, task_id).await,
        }
    }

    fn parse_task_result(&self, body: &[u8]) -> Result<TaskInfo, TaskError> {
        match self {
            ChannelAdaptor::Doubao(adaptor) => adaptor.parse_task_result(body),
        }
    }

    fn model_list(&self) -> &'static [&'static str] {
        match self {
            ChannelAdaptor::Doubao(adaptor) => adaptor.model_list(),
        }
    }

    fn channel_name(&self) -> &'static str {
        match self {
            ChannelAdaptor::Doubao(adaptor) => adaptor.channel_name(),
        }
    }
}
