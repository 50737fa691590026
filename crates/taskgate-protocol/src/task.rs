use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

pub const ACTION_VIDEO_GENERATION: &str = "video_generation";

/// Provider-independent video generation request accepted from callers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub image_tail: String,
    /// Seconds.
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub fps: u32,
    #[serde(default)]
    pub seed: i64,
    #[serde(default)]
    pub aspect_ratio: String,
    #[serde(default)]
    pub resolution: String,
    #[serde(default)]
    pub watermark: bool,
    #[serde(default)]
    pub camera_fixed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, JsonValue>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Queued,
    InProgress,
    Success,
    Failure,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Queued,
        TaskStatus::InProgress,
        TaskStatus::Success,
        TaskStatus::Failure,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "QUEUED",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Failure => "FAILURE",
        }
    }

    /// Unknown values fall back to `Queued`, never to `Failure`.
    pub fn parse(value: &str) -> TaskStatus {
        match value {
            "IN_PROGRESS" => TaskStatus::InProgress,
            "SUCCESS" => TaskStatus::Success,
            "FAILURE" => TaskStatus::Failure,
            _ => TaskStatus::Queued,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failure)
    }

    pub fn rank(self) -> u8 {
        match self {
            TaskStatus::Queued => 0,
            TaskStatus::InProgress => 1,
            TaskStatus::Success | TaskStatus::Failure => 2,
        }
    }

    /// Merge an observed status into the current one. Terminal states are
    /// sticky and a non-terminal state never moves backwards.
    pub fn advance(self, observed: TaskStatus) -> TaskStatus {
        if self.is_terminal() || observed.rank() < self.rank() {
            self
        } else {
            observed
        }
    }

    /// Stored statuses a write of `self` is allowed to replace.
    pub fn replaceable_by(self) -> Vec<TaskStatus> {
        TaskStatus::ALL
            .into_iter()
            .filter(|current| !current.is_terminal() && current.rank() <= self.rank())
            .collect()
    }

    pub fn progress(self) -> &'static str {
        match self {
            TaskStatus::Queued => "10%",
            TaskStatus::InProgress => "50%",
            TaskStatus::Success | TaskStatus::Failure => "100%",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const SUCCESS_WITHOUT_URL_REASON: &str = "provider reported success without a result url";

/// Canonical view of an upstream task after the provider vocabulary is mapped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub url: String,
}

impl TaskInfo {
    pub fn new(task_id: impl Into<String>, status: TaskStatus) -> Self {
        Self {
            task_id: task_id.into(),
            status,
            reason: String::new(),
            url: String::new(),
        }
    }

    /// Enforce "url set iff success".
    pub fn normalized(mut self) -> Self {
        match self.status {
            TaskStatus::Success if self.url.trim().is_empty() => {
                self.status = TaskStatus::Failure;
                if self.reason.is_empty() {
                    self.reason = SUCCESS_WITHOUT_URL_REASON.to_string();
                }
                self.url.clear();
            }
            TaskStatus::Success => {}
            _ => self.url.clear(),
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitTaskResponse {
    pub task_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchTaskRequest {
    pub task_id: String,
}

/// Poll response returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskView {
    pub task_id: String,
    pub status: TaskStatus,
    pub reason: String,
    pub url: String,
    pub progress: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_to_canonical_names() {
        let value = serde_json::to_value(TaskStatus::InProgress).unwrap();
        assert_eq!(value, "IN_PROGRESS");
        let parsed: TaskStatus = serde_json::from_str("\"FAILURE\"").unwrap();
        assert_eq!(parsed, TaskStatus::Failure);
    }

    #[test]
    fn advance_is_monotonic() {
        assert_eq!(TaskStatus::Queued.advance(TaskStatus::InProgress), TaskStatus::InProgress);
        assert_eq!(TaskStatus::InProgress.advance(TaskStatus::Queued), TaskStatus::InProgress);
        assert_eq!(TaskStatus::InProgress.advance(TaskStatus::Success), TaskStatus::Success);
        for terminal in [TaskStatus::Success, TaskStatus::Failure] {
            for observed in TaskStatus::ALL {
                assert_eq!(terminal.advance(observed), terminal);
            }
        }
    }

    #[test]
    fn terminal_statuses_are_never_replaceable() {
        for status in TaskStatus::ALL {
            let allowed = status.replaceable_by();
            assert!(!allowed.contains(&TaskStatus::Success));
            assert!(!allowed.contains(&TaskStatus::Failure));
        }
        assert_eq!(TaskStatus::Queued.replaceable_by(), vec![TaskStatus::Queued]);
        assert_eq!(
            TaskStatus::Failure.replaceable_by(),
            vec![TaskStatus::Queued, TaskStatus::InProgress]
        );
    }

    #[test]
    fn success_without_url_becomes_failure() {
        let info = TaskInfo::new("t-1", TaskStatus::Success).normalized();
        assert_eq!(info.status, TaskStatus::Failure);
        assert_eq!(info.reason, SUCCESS_WITHOUT_URL_REASON);
    }

    #[test]
    fn non_success_drops_url() {
        let mut info = TaskInfo::new("t-1", TaskStatus::InProgress);
        info.url = "https://cdn.example/v.mp4".to_string();
        let info = info.normalized();
        assert!(info.url.is_empty());
    }

    #[test]
    fn unknown_stored_status_parses_as_queued() {
        assert_eq!(TaskStatus::parse("PAUSED"), TaskStatus::Queued);
        assert_eq!(TaskStatus::parse("SUCCESS"), TaskStatus::Success);
    }
}
