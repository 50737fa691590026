use taskgate_protocol::doubao::response::{
    Envelope, EnvelopeTaskData, GetTaskResponse, ProviderError,
};
use taskgate_protocol::task::{TaskInfo, TaskStatus};

pub fn map_status(status: &str) -> TaskStatus {
    match status.to_ascii_lowercase().as_str() {
        "queued" => TaskStatus::Queued,
        "running" => TaskStatus::InProgress,
        "succeeded" => TaskStatus::Success,
        "failed" | "cancelled" => TaskStatus::Failure,
        _ => TaskStatus::Queued,
    }
}

/// `[code] message (Type: type)`, leaving out the empty parts.
pub fn error_reason(error: &ProviderError) -> String {
    let mut reason = error.message.clone();
    if !error.code.is_empty() {
        reason = format!("[{}] {}", error.code, reason);
    }
    if !error.r#type.is_empty() {
        reason = format!("{} (Type: {})", reason, error.r#type);
    }
    reason
}

pub fn from_ark(response: GetTaskResponse) -> TaskInfo {
    let mut info = TaskInfo::new(response.id, map_status(&response.status));
    info.reason = match &response.error {
        Some(error) => error_reason(error),
        None => response.reason,
    };
    info.url = response.content.video_url;
    info.normalized()
}

pub fn from_envelope(envelope: Envelope<EnvelopeTaskData>) -> TaskInfo {
    let data = envelope.data.unwrap_or_default();
    let mut info = TaskInfo::new(data.task_id, map_status(&data.status));
    info.reason = data.fail_reason;
    info.url = data.result.video_url;
    info.normalized()
}
