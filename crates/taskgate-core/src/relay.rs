use std::sync::Arc;

use tracing::{error, info, warn};

use taskgate_protocol::task::{SubmitTaskResponse, TaskStatus, TaskView};
use taskgate_provider_core::RegisteredChannel;

use crate::error::{RelayError, TokenError};
use crate::ledger::QuotaLedger;
use crate::store::{
    ACCOUNT_STATUS_ENABLED, AccountStore, TaskRecord, TaskStore, TaskUpdate,
};
use crate::token::TokenService;
use crate::unix_now;

pub type ChannelLookup = Arc<dyn Fn(i64) -> Option<RegisteredChannel> + Send + Sync>;

/// Who is submitting. Filled in by the auth layer in front of the router.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Caller {
    pub user_id: i64,
    pub token_id: Option<i64>,
}

pub fn task_view(task: &TaskRecord) -> TaskView {
    TaskView {
        task_id: task.task_id.clone(),
        status: task.status,
        reason: task.fail_reason.clone(),
        url: task.result_url.clone(),
        progress: task.progress.clone(),
    }
}

/// Drives submit and refresh for asynchronous provider tasks.
#[derive(Clone)]
pub struct TaskRelay {
    lookup: ChannelLookup,
    tasks: Arc<dyn TaskStore>,
    accounts: Arc<dyn AccountStore>,
    tokens: TokenService,
    ledger: QuotaLedger,
}

impl TaskRelay {
    pub fn new(
        lookup: ChannelLookup,
        tasks: Arc<dyn TaskStore>,
        accounts: Arc<dyn AccountStore>,
        tokens: TokenService,
        ledger: QuotaLedger,
    ) -> Self {
        Self {
            lookup,
            tasks,
            accounts,
            tokens,
            ledger,
        }
    }

    pub async fn submit(
        &self,
        channel_id: i64,
        caller: Caller,
        body: &[u8],
    ) -> Result<SubmitTaskResponse, RelayError> {
        let channel = (self.lookup)(channel_id).ok_or(RelayError::ChannelNotFound(channel_id))?;
        let adaptor = channel.adaptor.as_ref();
        let validated = adaptor.validate_request(body)?;
        let model = validated.request.model.clone();
        if !model.is_empty() && !adaptor.model_list().contains(&model.as_str()) {
            return Err(RelayError::UnsupportedModel(model));
        }

        let quota = channel.context.quota_for(&model);
        self.precheck(caller, &model, quota).await?;

        let request = adaptor.build_request(&validated)?;
        let response = adaptor.do_request(request).await?;
        let submitted = adaptor.parse_submit_response(&response)?;

        let now = unix_now();
        let task = TaskRecord {
            task_id: submitted.task_id.clone(),
            channel_id,
            platform: adaptor.channel_name().to_string(),
            user_id: caller.user_id,
            token_id: caller.token_id,
            action: validated.action.to_string(),
            model,
            status: TaskStatus::Queued,
            progress: TaskStatus::Queued.progress().to_string(),
            request_payload: serde_json::to_string(&validated.request).unwrap_or_default(),
            task_data: String::from_utf8_lossy(&submitted.task_data).into_owned(),
            result_url: String::new(),
            fail_reason: String::new(),
            quota,
            charged: false,
            submit_time: now,
            start_time: 0,
            finish_time: 0,
            created_at: now,
            updated_at: now,
        };
        if let Err(err) = self.tasks.insert_task(task).await {
            error!(
                event = "task_persist_failed",
                task_id = %submitted.task_id,
                channel_id = channel_id,
                error = %err
            );
            return Err(err.into());
        }
        info!(
            event = "task_submitted",
            task_id = %submitted.task_id,
            channel_id = channel_id,
            user_id = caller.user_id,
            provider = %adaptor.channel_name(),
            quota = quota
        );
        Ok(SubmitTaskResponse {
            task_id: submitted.task_id,
        })
    }

    async fn precheck(&self, caller: Caller, model: &str, quota: i64) -> Result<(), RelayError> {
        let account = self
            .accounts
            .get_account(caller.user_id)
            .await?
            .ok_or(RelayError::AccountNotFound(caller.user_id))?;
        if account.status != ACCOUNT_STATUS_ENABLED {
            return Err(RelayError::AccountDisabled(caller.user_id));
        }
        if account.quota < quota {
            return Err(RelayError::InsufficientQuota {
                needed: quota,
                available: account.quota,
            });
        }
        if let Some(token_id) = caller.token_id {
            let token = self.tokens.validate_id(token_id, unix_now()).await?;
            if token.user_id != caller.user_id {
                return Err(TokenError::WrongOwner.into());
            }
            if !token.allows_model(model) {
                return Err(TokenError::ModelNotAllowed(model.to_string()).into());
            }
            if !token.unlimited_quota && token.remain_quota < quota {
                return Err(TokenError::Exhausted.into());
            }
        }
        Ok(())
    }

    /// Re-query the provider and persist any forward status change. Safe to
    /// run concurrently for one task: the charge for a `SUCCESS` task is
    /// claimed once, and a charge that failed earlier is retried here.
    pub async fn refresh(&self, task_id: &str) -> Result<TaskView, RelayError> {
        if task_id.trim().is_empty() {
            return Err(RelayError::InvalidTaskId);
        }
        let task = self
            .tasks
            .get_task(task_id)
            .await?
            .ok_or_else(|| RelayError::TaskNotFound(task_id.to_string()))?;
        if task.status.is_terminal() {
            if task.status == TaskStatus::Success && !task.charged {
                self.settle(&task).await;
            }
            return Ok(task_view(&task));
        }

        let channel = (self.lookup)(task.channel_id)
            .ok_or(RelayError::ChannelNotFound(task.channel_id))?;
        let adaptor = channel.adaptor.as_ref();
        let response = adaptor
            .fetch_task(&channel.context.base_url, &channel.context.api_key, &task.task_id)
            .await
            .inspect_err(|err| {
                warn!(event = "task_fetch_failed", task_id = %task.task_id, error = %err);
            })?;
        let info = adaptor
            .parse_task_result(&response.body)
            .inspect_err(|err| {
                warn!(event = "task_decode_failed", task_id = %task.task_id, error = %err);
            })?
            .normalized();

        let next = task.status.advance(info.status);
        let now = unix_now();
        let update = TaskUpdate {
            status: next,
            progress: next.progress().to_string(),
            task_data: String::from_utf8_lossy(&response.body).into_owned(),
            result_url: if next == TaskStatus::Success {
                info.url
            } else {
                String::new()
            },
            fail_reason: info.reason,
            start_time: if task.start_time == 0 && next != TaskStatus::Queued {
                now
            } else {
                task.start_time
            },
            finish_time: if next.is_terminal() { now } else { 0 },
            updated_at: now,
        };

        let mut updated = task.clone();
        update.apply(&mut updated);
        let applied = self
            .tasks
            .update_task_if(&task.task_id, &next.replaceable_by(), update)
            .await?;
        if !applied {
            // Another refresh got there first.
            let current = self
                .tasks
                .get_task(task_id)
                .await?
                .ok_or_else(|| RelayError::TaskNotFound(task_id.to_string()))?;
            return Ok(task_view(&current));
        }

        if next != task.status {
            info!(
                event = "task_status",
                task_id = %task.task_id,
                from = %task.status,
                to = %next
            );
        }
        if next == TaskStatus::Success {
            self.settle(&updated).await;
        }
        Ok(task_view(&updated))
    }

    async fn settle(&self, task: &TaskRecord) {
        if let Err(err) = self.ledger.charge_task(task).await {
            error!(event = "task_charge_failed", task_id = %task.task_id, error = %err);
        }
    }
}
