pub mod memory;

pub use memory::MemoryStore;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use taskgate_protocol::task::TaskStatus;

use crate::error::StoreError;

pub const ACCOUNT_STATUS_ENABLED: i32 = 1;
pub const ACCOUNT_STATUS_DISABLED: i32 = 2;

/// Persisted relay job. `task_id` is issued by the provider and never changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub channel_id: i64,
    pub platform: String,
    pub user_id: i64,
    pub token_id: Option<i64>,
    pub action: String,
    pub model: String,
    pub status: TaskStatus,
    pub progress: String,
    pub request_payload: String,
    pub task_data: String,
    pub result_url: String,
    pub fail_reason: String,
    pub quota: i64,
    /// Set once the account (and token) have been debited for this task.
    #[serde(default)]
    pub charged: bool,
    pub submit_time: i64,
    pub start_time: i64,
    pub finish_time: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Fields a refresh is allowed to write.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskUpdate {
    pub status: TaskStatus,
    pub progress: String,
    pub task_data: String,
    pub result_url: String,
    pub fail_reason: String,
    pub start_time: i64,
    pub finish_time: i64,
    pub updated_at: i64,
}

impl TaskUpdate {
    pub fn apply(&self, task: &mut TaskRecord) {
        task.status = self.status;
        task.progress = self.progress.clone();
        task.task_data = self.task_data.clone();
        task.result_url = self.result_url.clone();
        task.fail_reason = self.fail_reason.clone();
        task.start_time = self.start_time;
        task.finish_time = self.finish_time;
        task.updated_at = self.updated_at;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub id: i64,
    pub username: String,
    pub display_name: String,
    /// Argon2 PHC string.
    #[serde(skip_serializing, default)]
    pub password: String,
    pub status: i32,
    pub quota: i64,
    pub used_quota: i64,
    pub request_count: i64,
    pub group: String,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum TokenStatus {
    Enabled,
    Disabled,
    Expired,
    Exhausted,
}

impl TokenStatus {
    pub fn as_i32(self) -> i32 {
        match self {
            TokenStatus::Enabled => 1,
            TokenStatus::Disabled => 2,
            TokenStatus::Expired => 3,
            TokenStatus::Exhausted => 4,
        }
    }
}

impl TryFrom<i32> for TokenStatus {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, String> {
        match value {
            1 => Ok(TokenStatus::Enabled),
            2 => Ok(TokenStatus::Disabled),
            3 => Ok(TokenStatus::Expired),
            4 => Ok(TokenStatus::Exhausted),
            other => Err(format!("unknown token status {other}")),
        }
    }
}

impl From<TokenStatus> for i32 {
    fn from(status: TokenStatus) -> Self {
        status.as_i32()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub id: i64,
    pub key: String,
    pub user_id: i64,
    pub name: String,
    pub status: TokenStatus,
    pub remain_quota: i64,
    pub unlimited_quota: bool,
    pub used_quota: i64,
    /// Unix seconds, `-1` for never.
    pub expired_time: i64,
    pub model_limits_enabled: bool,
    pub model_limits: String,
    pub allow_ips: Option<String>,
    pub group: String,
    pub created_time: i64,
    pub accessed_time: i64,
}

impl TokenRecord {
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expired_time != -1 && self.expired_time <= now
    }

    pub fn is_exhausted(&self) -> bool {
        !self.unlimited_quota && self.remain_quota <= 0
    }

    pub fn allows_model(&self, model: &str) -> bool {
        !self.model_limits_enabled
            || self
                .model_limits
                .split(',')
                .map(str::trim)
                .any(|allowed| allowed == model)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum LogType {
    #[default]
    Unknown,
    Topup,
    Consume,
    Manage,
    System,
    Error,
}

impl LogType {
    pub fn as_i32(self) -> i32 {
        match self {
            LogType::Unknown => 0,
            LogType::Topup => 1,
            LogType::Consume => 2,
            LogType::Manage => 3,
            LogType::System => 4,
            LogType::Error => 5,
        }
    }
}

impl TryFrom<i32> for LogType {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, String> {
        match value {
            0 => Ok(LogType::Unknown),
            1 => Ok(LogType::Topup),
            2 => Ok(LogType::Consume),
            3 => Ok(LogType::Manage),
            4 => Ok(LogType::System),
            5 => Ok(LogType::Error),
            other => Err(format!("unknown log type {other}")),
        }
    }
}

impl From<LogType> for i32 {
    fn from(value: LogType) -> Self {
        value.as_i32()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageLogRecord {
    pub id: i64,
    pub user_id: i64,
    pub created_at: i64,
    #[serde(rename = "type")]
    pub log_type: LogType,
    pub content: String,
    pub username: String,
    pub token_name: String,
    pub model_name: String,
    pub quota: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub use_time: i64,
    pub is_stream: bool,
    #[serde(rename = "channel")]
    pub channel_id: i64,
    pub token_id: i64,
    pub group: String,
    pub ip: String,
}

/// Log query filter. `None` and empty strings match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogFilter {
    /// Raw type code, so an unknown code matches no entry.
    pub log_type: Option<i32>,
    pub user_id: Option<i64>,
    pub username: Option<String>,
    pub token_name: Option<String>,
    pub model_name: Option<String>,
    pub channel_id: Option<i64>,
    pub group: Option<String>,
    pub start_timestamp: Option<i64>,
    pub end_timestamp: Option<i64>,
}

impl LogFilter {
    pub fn matches(&self, entry: &UsageLogRecord) -> bool {
        fn text(filter: &Option<String>, value: &str) -> bool {
            filter
                .as_deref()
                .is_none_or(|wanted| wanted.is_empty() || wanted == value)
        }
        self.log_type
            .is_none_or(|wanted| wanted == entry.log_type.as_i32())
            && self.user_id.is_none_or(|wanted| wanted == entry.user_id)
            && self.channel_id.is_none_or(|wanted| wanted == entry.channel_id)
            && self
                .start_timestamp
                .is_none_or(|start| entry.created_at >= start)
            && self.end_timestamp.is_none_or(|end| entry.created_at <= end)
            && text(&self.username, &entry.username)
            && text(&self.token_name, &entry.token_name)
            && text(&self.model_name, &entry.model_name)
            && text(&self.group, &entry.group)
    }
}

/// Consumption aggregate: total quota plus the request and token rate over
/// the trailing minute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogStat {
    pub quota: i64,
    pub rpm: i64,
    pub tpm: i64,
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert_task(&self, task: TaskRecord) -> Result<(), StoreError>;

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError>;

    /// Write `update` only while the stored status is one of `allowed`.
    /// Returns whether the write happened.
    async fn update_task_if(
        &self,
        task_id: &str,
        allowed: &[TaskStatus],
        update: TaskUpdate,
    ) -> Result<bool, StoreError>;

    /// Atomically claim an uncharged `SUCCESS` task and debit its quota from
    /// the account (balance, used, request count) and from the token when one
    /// is set. Returns `false` when there was nothing to claim. On error
    /// nothing is written, so the charge can be retried.
    async fn settle_charge(&self, task_id: &str) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Soft-deleted accounts are not returned.
    async fn get_account(&self, id: i64) -> Result<Option<AccountRecord>, StoreError>;

    /// Also matches soft-deleted accounts.
    async fn username_taken(&self, username: &str) -> Result<bool, StoreError>;

    /// Fails with `StoreError::Conflict` on a repeated id or username.
    async fn insert_account(&self, account: AccountRecord) -> Result<AccountRecord, StoreError>;

    /// Atomically add `delta` to the balance. `None` when the account is unknown.
    async fn adjust_quota(&self, id: i64, delta: i64)
    -> Result<Option<AccountRecord>, StoreError>;

    /// Unlike `get_account`, also matches soft-deleted accounts.
    async fn account_id_taken(&self, id: i64) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Assigns the id.
    async fn insert_token(&self, token: TokenRecord) -> Result<TokenRecord, StoreError>;

    async fn get_token(&self, id: i64) -> Result<Option<TokenRecord>, StoreError>;

    async fn get_token_by_key(&self, key: &str) -> Result<Option<TokenRecord>, StoreError>;

    /// Overwrite the stored row with the same id.
    async fn update_token(&self, token: &TokenRecord) -> Result<(), StoreError>;

    async fn set_token_status(&self, id: i64, status: TokenStatus) -> Result<(), StoreError>;

}

#[async_trait]
pub trait UsageLogStore: Send + Sync {
    async fn append_log(&self, entry: UsageLogRecord) -> Result<(), StoreError>;

    /// Newest first. Returns the page and the total match count.
    async fn query_logs(
        &self,
        filter: &LogFilter,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<UsageLogRecord>, u64), StoreError>;

    /// Aggregate consumption entries matching `filter`; rates count entries
    /// created at or after `since`.
    async fn stat_logs(&self, filter: &LogFilter, since: i64) -> Result<LogStat, StoreError>;
}

/// Handles to every store the services need.
#[derive(Clone)]
pub struct Stores {
    pub tasks: Arc<dyn TaskStore>,
    pub accounts: Arc<dyn AccountStore>,
    pub tokens: Arc<dyn TokenStore>,
    pub logs: Arc<dyn UsageLogStore>,
}

impl Stores {
    pub fn from_backend<S>(backend: Arc<S>) -> Self
    where
        S: TaskStore + AccountStore + TokenStore + UsageLogStore + 'static,
    {
        Self {
            tasks: backend.clone(),
            accounts: backend.clone(),
            tokens: backend.clone(),
            logs: backend,
        }
    }

    pub fn memory() -> Self {
        Self::from_backend(Arc::new(MemoryStore::default()))
    }
}
