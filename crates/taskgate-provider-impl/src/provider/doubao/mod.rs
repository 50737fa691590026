mod payload;
mod result;

pub use payload::convert_request;
pub use result::{error_reason, map_status};

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use tracing::warn;

use taskgate_protocol::doubao::response::{
    CreateTaskResponse, Envelope, EnvelopeSubmitData, EnvelopeTaskData, GetTaskResponse,
};
use taskgate_protocol::task::{ACTION_VIDEO_GENERATION, TaskInfo, VideoRequest};
use taskgate_provider_core::{
    ChannelContext, DEFAULT_TIMEOUT, SubmittedTask, TaskAdaptor, TaskError, TransportError,
    UpstreamRequest, UpstreamResponse, ValidatedRequest,
};

use crate::upstream::{build_url, send_with_logging};

pub const PROVIDER_NAME: &str = "doubao";
pub const DEFAULT_BASE_URL: &str = "https://ark.cn-beijing.volces.com";
pub const TASKS_PATH: &str = "/api/v3/contents/generations/tasks";

pub const MODEL_LIST: &[&str] = &[
    "doubao-seedance-lite",
    "doubao-seedance-1-0-lite-t2v",
    "doubao-seedance-1-0-lite-i2v",
    "doubao-seedance-pronew",
    "doubao-seaweed",
    "wan2-1-14b-t2v",
    "wan2-1-14b-i2v",
    "wan2-1-14b-flf2v",
];

/// Response shape spoken by the channel, chosen by the `protocol` setting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DoubaoProtocol {
    /// Flat `{id, status, content, error, reason}` records.
    #[default]
    ArkV3,
    /// `{code, msg, data}` wrapped records.
    Envelope,
}

impl DoubaoProtocol {
    pub fn from_setting(value: Option<&str>) -> Self {
        match value.map(|value| value.trim().to_ascii_lowercase()) {
            None => DoubaoProtocol::ArkV3,
            Some(value) if value.is_empty() || value == "ark_v3" => DoubaoProtocol::ArkV3,
            Some(value) if value == "envelope" => DoubaoProtocol::Envelope,
            Some(value) => {
                warn!(
                    event = "channel_setting",
                    provider = %PROVIDER_NAME,
                    setting = "protocol",
                    value = %value,
                    "unknown protocol, using ark_v3"
                );
                DoubaoProtocol::ArkV3
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct DoubaoAdaptor {
    channel_id: i64,
    base_url: String,
    api_key: String,
    timeout: Duration,
    protocol: DoubaoProtocol,
}

impl Default for DoubaoAdaptor {
    fn default() -> Self {
        Self {
            channel_id: 0,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: String::new(),
            timeout: DEFAULT_TIMEOUT,
            protocol: DoubaoProtocol::ArkV3,
        }
    }
}

impl DoubaoAdaptor {
    pub fn new(channel: &ChannelContext) -> Self {
        let mut adaptor = Self::default();
        adaptor.initialize(channel);
        adaptor
    }

    pub fn channel_id(&self) -> i64 {
        self.channel_id
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn protocol(&self) -> DoubaoProtocol {
        self.protocol
    }
}

#[async_trait]
impl TaskAdaptor for DoubaoAdaptor {
    fn initialize(&mut self, channel: &ChannelContext) {
        self.channel_id = channel.channel_id;
        self.base_url = if channel.base_url.trim().is_empty() {
            DEFAULT_BASE_URL.to_string()
        } else {
            channel.base_url.clone()
        };
        self.api_key = channel.api_key.clone();
        self.timeout = channel.timeout;
        self.protocol = DoubaoProtocol::from_setting(channel.setting_str("protocol"));
    }

    fn validate_request(&self, body: &[u8]) -> Result<ValidatedRequest, TaskError> {
        let request: VideoRequest = serde_json::from_slice(body).map_err(|err| {
            TaskError::bad_request("invalid_request", format!("Invalid request format: {err}"))
        })?;
        if request.prompt.is_empty() && request.image.is_empty() {
            return Err(TaskError::bad_request(
                "missing_required_field",
                "prompt or image is required",
            ));
        }
        Ok(ValidatedRequest {
            action: ACTION_VIDEO_GENERATION,
            request,
        })
    }

    fn build_request(&self, request: &ValidatedRequest) -> Result<UpstreamRequest, TaskError> {
        let payload = convert_request(&request.request);
        let body = serde_json::to_vec(&payload).map_err(|err| {
            TaskError::internal("marshal_request_failed", format!("failed to marshal request: {err}"))
        })?;
        let headers = build_headers(&self.api_key)
            .map_err(|message| TaskError::internal("invalid_api_key", message))?;
        Ok(UpstreamRequest {
            method: Method::POST,
            url: build_url(&self.base_url, TASKS_PATH),
            headers,
            body: Bytes::from(body),
        })
    }

    async fn do_request(
        &self,
        request: UpstreamRequest,
    ) -> Result<UpstreamResponse, TransportError> {
        send_with_logging(PROVIDER_NAME, "doubao.submit", request, self.timeout).await
    }

    fn parse_submit_response(
        &self,
        response: &UpstreamResponse,
    ) -> Result<SubmittedTask, TaskError> {
        let task_id = match self.protocol {
            DoubaoProtocol::ArkV3 => {
                let parsed: CreateTaskResponse =
                    serde_json::from_slice(&response.body).map_err(unmarshal_failed)?;
                if parsed.code != 0 {
                    return Err(api_error(&parsed.msg, parsed.code));
                }
                if let Some(error) = &parsed.error {
                    return Err(TaskError::bad_request("api_error", error_reason(error)));
                }
                parsed.id
            }
            DoubaoProtocol::Envelope => {
                let parsed: Envelope<EnvelopeSubmitData> =
                    serde_json::from_slice(&response.body).map_err(unmarshal_failed)?;
                if parsed.code != 0 {
                    return Err(api_error(&parsed.msg, parsed.code));
                }
                parsed.data.map(|data| data.task_id).unwrap_or_default()
            }
        };
        if task_id.is_empty() {
            return Err(TaskError::new(
                StatusCode::BAD_GATEWAY,
                "empty_task_id",
                "upstream accepted the task without returning an id",
            ));
        }
        Ok(SubmittedTask {
            task_id,
            task_data: response.body.clone(),
        })
    }

    async fn fetch_task(
        &self,
        base_url: &str,
        api_key: &str,
        task_id: &str,
    ) -> Result<UpstreamResponse, TransportError> {
        if task_id.trim().is_empty() {
            return Err(TransportError::InvalidRequest("invalid task_id".to_string()));
        }
        let base_url = if base_url.trim().is_empty() {
            DEFAULT_BASE_URL
        } else {
            base_url
        };
        let headers = build_headers(api_key).map_err(TransportError::InvalidRequest)?;
        let request = UpstreamRequest {
            method: Method::GET,
            url: build_url(base_url, &format!("{TASKS_PATH}/{task_id}")),
            headers,
            body: Bytes::new(),
        };
        send_with_logging(PROVIDER_NAME, "doubao.fetch", request, self.timeout).await
    }

    fn parse_task_result(&self, body: &[u8]) -> Result<TaskInfo, TaskError> {
        match self.protocol {
            DoubaoProtocol::ArkV3 => {
                let parsed: GetTaskResponse =
                    serde_json::from_slice(body).map_err(unmarshal_task_failed)?;
                Ok(result::from_ark(parsed))
            }
            DoubaoProtocol::Envelope => {
                let parsed: Envelope<EnvelopeTaskData> =
                    serde_json::from_slice(body).map_err(unmarshal_task_failed)?;
                if parsed.code != 0 {
                    return Err(TaskError::new(
                        StatusCode::BAD_GATEWAY,
                        "api_error",
                        format!("API error: {} (code: {})", parsed.msg, parsed.code),
                    ));
                }
                Ok(result::from_envelope(parsed))
            }
        }
    }

    fn model_list(&self) -> &'static [&'static str] {
        MODEL_LIST
    }

    fn channel_name(&self) -> &'static str {
        PROVIDER_NAME
    }
}

fn build_headers(api_key: &str) -> Result<HeaderMap, String> {
    let mut headers = HeaderMap::new();
    let mut bearer = String::with_capacity(api_key.len() + 7);
    bearer.push_str("Bearer ");
    bearer.push_str(api_key);
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&bearer).map_err(|err| err.to_string())?,
    );
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(headers)
}

fn api_error(msg: &str, code: i64) -> TaskError {
    TaskError::bad_request("api_error", format!("API error: {msg} (code: {code})"))
}

fn unmarshal_failed(err: serde_json::Error) -> TaskError {
    TaskError::internal(
        "unmarshal_response_failed",
        format!("Failed to unmarshal response: {err}"),
    )
}

fn unmarshal_task_failed(err: serde_json::Error) -> TaskError {
    TaskError::new(
        StatusCode::BAD_GATEWAY,
        "unmarshal_task_failed",
        format!("failed to unmarshal task response: {err}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;
    use taskgate_protocol::task::TaskStatus;
    use taskgate_provider_core::ChannelType;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adaptor_for(base_url: &str, protocol: Option<&str>) -> DoubaoAdaptor {
        let mut channel = ChannelContext::new(7, ChannelType::Doubao, base_url, "ark-key");
        if let Some(protocol) = protocol {
            channel.settings = json!({ "protocol": protocol });
        }
        DoubaoAdaptor::new(&channel)
    }

    fn ok_response(body: serde_json::Value) -> UpstreamResponse {
        UpstreamResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::from(body.to_string()),
        }
    }

    #[test]
    fn initialize_is_idempotent() {
        let channel = ChannelContext::new(3, ChannelType::Doubao, "", "k");
        let mut adaptor = DoubaoAdaptor::default();
        adaptor.initialize(&channel);
        let first = adaptor.clone();
        adaptor.initialize(&channel);
        assert_eq!(adaptor.channel_id(), first.channel_id());
        assert_eq!(adaptor.base_url(), DEFAULT_BASE_URL);
        assert_eq!(adaptor.protocol(), DoubaoProtocol::ArkV3);
    }

    #[test]
    fn image_only_request_is_accepted() {
        let adaptor = adaptor_for("http://ark", None);
        let validated = adaptor
            .validate_request(br#"{"model":"wan2-1-14b-i2v","image":"https://img/a.png"}"#)
            .unwrap();
        assert_eq!(validated.action, ACTION_VIDEO_GENERATION);
        assert_eq!(validated.request.image, "https://img/a.png");
    }

    #[test]
    fn request_without_prompt_or_image_is_rejected() {
        let adaptor = adaptor_for("http://ark", None);
        let err = adaptor
            .validate_request(br#"{"model":"doubao-seaweed"}"#)
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.code, "missing_required_field");
        assert_eq!(err.message, "prompt or image is required");
    }

    #[test]
    fn malformed_body_is_invalid_request() {
        let adaptor = adaptor_for("http://ark", None);
        let err = adaptor.validate_request(b"{not json").unwrap_err();
        assert_eq!(err.code, "invalid_request");
        assert!(err.message.starts_with("Invalid request format: "));
    }

    #[test]
    fn build_request_targets_tasks_endpoint() {
        let adaptor = adaptor_for("http://ark/", None);
        let validated = adaptor
            .validate_request(br#"{"model":"doubao-seaweed","prompt":"sunrise"}"#)
            .unwrap();
        let request = adaptor.build_request(&validated).unwrap();
        assert_eq!(request.method, Method::POST);
        assert_eq!(request.url, "http://ark/api/v3/contents/generations/tasks");
        assert_eq!(request.headers[AUTHORIZATION], "Bearer ark-key");
        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
        assert_eq!(body["content"][0]["text"], "sunrise --wm false --cf false");
    }

    #[test]
    fn nonzero_submit_code_is_api_error() {
        let adaptor = adaptor_for("http://ark", None);
        let err = adaptor
            .parse_submit_response(&ok_response(json!({ "code": 1001, "msg": "quota exceeded" })))
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.code, "api_error");
        assert_eq!(err.message, "API error: quota exceeded (code: 1001)");
    }

    #[test]
    fn submit_without_id_is_rejected() {
        let adaptor = adaptor_for("http://ark", None);
        let err = adaptor
            .parse_submit_response(&ok_response(json!({ "code": 0 })))
            .unwrap_err();
        assert_eq!(err.code, "empty_task_id");
    }

    #[test]
    fn envelope_protocol_reads_nested_records() {
        let adaptor = adaptor_for("http://ark", Some("envelope"));
        let submitted = adaptor
            .parse_submit_response(&ok_response(
                json!({ "code": 0, "msg": "ok", "data": { "task_id": "env-1" } }),
            ))
            .unwrap();
        assert_eq!(submitted.task_id, "env-1");

        let body = json!({
            "code": 0,
            "data": {
                "task_id": "env-1",
                "status": "succeeded",
                "result": { "video_url": "https://cdn/v.mp4" }
            }
        });
        let info = adaptor
            .parse_task_result(body.to_string().as_bytes())
            .unwrap();
        assert_eq!(info.status, TaskStatus::Success);
        assert_eq!(info.url, "https://cdn/v.mp4");

        let err = adaptor
            .parse_task_result(br#"{"code":5,"msg":"not found"}"#)
            .unwrap_err();
        assert_eq!(err.code, "api_error");
    }

    #[test]
    fn success_without_video_url_becomes_failure() {
        let adaptor = adaptor_for("http://ark", None);
        let info = adaptor
            .parse_task_result(br#"{"id":"cgt-9","status":"succeeded","content":{}}"#)
            .unwrap();
        assert_eq!(info.status, TaskStatus::Failure);
        assert!(info.url.is_empty());
        assert!(!info.reason.is_empty());
    }

    #[test]
    fn undecodable_task_body_is_error() {
        let adaptor = adaptor_for("http://ark", None);
        let err = adaptor.parse_task_result(b"<html>").unwrap_err();
        assert_eq!(err.code, "unmarshal_task_failed");
    }

    #[tokio::test]
    async fn submit_and_fetch_round_trip_against_upstream() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TASKS_PATH))
            .and(header("authorization", "Bearer ark-key"))
            .and(body_partial_json(json!({ "model": "doubao-seaweed" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "cgt-42" })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{TASKS_PATH}/cgt-42")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "cgt-42",
                "status": "running",
                "content": {}
            })))
            .mount(&server)
            .await;

        let adaptor = adaptor_for(&server.uri(), None);
        let validated = adaptor
            .validate_request(br#"{"model":"doubao-seaweed","prompt":"a fox"}"#)
            .unwrap();
        let request = adaptor.build_request(&validated).unwrap();
        let response = adaptor.do_request(request).await.unwrap();
        let submitted = adaptor.parse_submit_response(&response).unwrap();
        assert_eq!(submitted.task_id, "cgt-42");

        let response = adaptor
            .fetch_task(&server.uri(), "ark-key", &submitted.task_id)
            .await
            .unwrap();
        let info = adaptor.parse_task_result(&response.body).unwrap();
        assert_eq!(info.status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn rejected_submit_surfaces_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TASKS_PATH))
            .respond_with(
                ResponseTemplate::new(401).set_body_string(r#"{"error":{"code":"AuthenticationError"}}"#),
            )
            .mount(&server)
            .await;

        let adaptor = adaptor_for(&server.uri(), None);
        let validated = adaptor
            .validate_request(br#"{"prompt":"a fox"}"#)
            .unwrap();
        let request = adaptor.build_request(&validated).unwrap();
        let err = adaptor.do_request(request).await.unwrap_err();
        assert_matches!(err, TransportError::Status { status, ref body } => {
            assert_eq!(status, StatusCode::UNAUTHORIZED);
            assert!(String::from_utf8_lossy(body).contains("AuthenticationError"));
        });
    }

    #[tokio::test]
    async fn fetch_with_empty_task_id_is_refused() {
        let adaptor = adaptor_for("http://ark", None);
        let err = adaptor.fetch_task("http://ark", "k", "").await.unwrap_err();
        assert_matches!(err, TransportError::InvalidRequest(_));
    }
}
