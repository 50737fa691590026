use std::sync::RwLock;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use taskgate_protocol::task::TaskStatus;

use crate::error::StoreError;
use crate::store::{
    AccountRecord, AccountStore, LogFilter, LogStat, LogType, TaskRecord, TaskStore, TaskUpdate,
    TokenRecord, TokenStatus, TokenStore, UsageLogRecord, UsageLogStore,
};

/// Process-local store. Row mutations run under the DashMap shard lock of the
/// row, so read-modify-write updates do not interleave.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tasks: DashMap<String, TaskRecord>,
    accounts: DashMap<i64, AccountRecord>,
    usernames: DashMap<String, i64>,
    tokens: DashMap<i64, TokenRecord>,
    token_keys: DashMap<String, i64>,
    next_token_id: AtomicI64,
    logs: RwLock<Vec<UsageLogRecord>>,
    next_log_id: AtomicI64,
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Backend("log table lock poisoned".to_string())
}

fn overflow() -> StoreError {
    StoreError::Backend("quota out of range".to_string())
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn insert_task(&self, task: TaskRecord) -> Result<(), StoreError> {
        match self.tasks.entry(task.task_id.clone()) {
            Entry::Occupied(_) => Err(StoreError::Conflict(format!("task {}", task.task_id))),
            Entry::Vacant(slot) => {
                slot.insert(task);
                Ok(())
            }
        }
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self.tasks.get(task_id).map(|task| task.clone()))
    }

    async fn update_task_if(
        &self,
        task_id: &str,
        allowed: &[TaskStatus],
        update: TaskUpdate,
    ) -> Result<bool, StoreError> {
        let Some(mut task) = self.tasks.get_mut(task_id) else {
            return Ok(false);
        };
        if !allowed.contains(&task.status) {
            return Ok(false);
        }
        update.apply(&mut task);
        Ok(true)
    }

    async fn settle_charge(&self, task_id: &str) -> Result<bool, StoreError> {
        let Some(mut task) = self.tasks.get_mut(task_id) else {
            return Ok(false);
        };
        if task.status != TaskStatus::Success || task.charged {
            return Ok(false);
        }
        let quota = task.quota;
        let Some(mut account) = self
            .accounts
            .get_mut(&task.user_id)
            .filter(|account| account.deleted_at.is_none())
        else {
            return Err(StoreError::Backend(format!("user {} not found", task.user_id)));
        };
        let balance = account.quota.checked_sub(quota).ok_or_else(overflow)?;
        let used = account.used_quota.checked_add(quota).ok_or_else(overflow)?;

        let mut token = task.token_id.and_then(|id| self.tokens.get_mut(&id));
        let token_debit = match token.as_deref() {
            Some(token) => Some((
                if token.unlimited_quota {
                    token.remain_quota
                } else {
                    token.remain_quota.checked_sub(quota).ok_or_else(overflow)?
                },
                token.used_quota.checked_add(quota).ok_or_else(overflow)?,
            )),
            None => None,
        };

        account.quota = balance;
        account.used_quota = used;
        account.request_count += 1;
        if let (Some(token), Some((remain, used))) = (token.as_deref_mut(), token_debit) {
            token.remain_quota = remain;
            token.used_quota = used;
        }
        task.charged = true;
        Ok(true)
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn get_account(&self, id: i64) -> Result<Option<AccountRecord>, StoreError> {
        Ok(self
            .accounts
            .get(&id)
            .filter(|account| account.deleted_at.is_none())
            .map(|account| account.clone()))
    }

    async fn username_taken(&self, username: &str) -> Result<bool, StoreError> {
        Ok(self.usernames.contains_key(username))
    }

    async fn insert_account(&self, account: AccountRecord) -> Result<AccountRecord, StoreError> {
        let Entry::Vacant(name_slot) = self.usernames.entry(account.username.clone()) else {
            return Err(StoreError::Conflict(format!("username {}", account.username)));
        };
        match self.accounts.entry(account.id) {
            Entry::Occupied(_) => Err(StoreError::Conflict(format!("user id {}", account.id))),
            Entry::Vacant(slot) => {
                name_slot.insert(account.id);
                slot.insert(account.clone());
                Ok(account)
            }
        }
    }

    async fn adjust_quota(
        &self,
        id: i64,
        delta: i64,
    ) -> Result<Option<AccountRecord>, StoreError> {
        let Some(mut account) = self.accounts.get_mut(&id) else {
            return Ok(None);
        };
        if account.deleted_at.is_some() {
            return Ok(None);
        }
        account.quota = account.quota.checked_add(delta).ok_or_else(overflow)?;
        Ok(Some(account.clone()))
    }

    async fn account_id_taken(&self, id: i64) -> Result<bool, StoreError> {
        Ok(self.accounts.contains_key(&id))
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn insert_token(&self, mut token: TokenRecord) -> Result<TokenRecord, StoreError> {
        let Entry::Vacant(key_slot) = self.token_keys.entry(token.key.clone()) else {
            return Err(StoreError::Conflict("token key".to_string()));
        };
        token.id = self.next_token_id.fetch_add(1, Ordering::SeqCst) + 1;
        key_slot.insert(token.id);
        self.tokens.insert(token.id, token.clone());
        Ok(token)
    }

    async fn get_token(&self, id: i64) -> Result<Option<TokenRecord>, StoreError> {
        Ok(self.tokens.get(&id).map(|token| token.clone()))
    }

    async fn get_token_by_key(&self, key: &str) -> Result<Option<TokenRecord>, StoreError> {
        let Some(id) = self.token_keys.get(key).map(|id| *id) else {
            return Ok(None);
        };
        self.get_token(id).await
    }

    async fn update_token(&self, token: &TokenRecord) -> Result<(), StoreError> {
        match self.tokens.get_mut(&token.id) {
            Some(mut stored) => {
                *stored = token.clone();
                Ok(())
            }
            None => Err(StoreError::Backend(format!("token {} not found", token.id))),
        }
    }

    async fn set_token_status(&self, id: i64, status: TokenStatus) -> Result<(), StoreError> {
        if let Some(mut token) = self.tokens.get_mut(&id) {
            token.status = status;
        }
        Ok(())
    }
}

#[async_trait]
impl UsageLogStore for MemoryStore {
    async fn append_log(&self, mut entry: UsageLogRecord) -> Result<(), StoreError> {
        entry.id = self.next_log_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.logs.write().map_err(poisoned)?.push(entry);
        Ok(())
    }

    async fn query_logs(
        &self,
        filter: &LogFilter,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<UsageLogRecord>, u64), StoreError> {
        let logs = self.logs.read().map_err(poisoned)?;
        let matching: Vec<&UsageLogRecord> =
            logs.iter().rev().filter(|entry| filter.matches(entry)).collect();
        let total = matching.len() as u64;
        let page = matching
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect();
        Ok((page, total))
    }

    async fn stat_logs(&self, filter: &LogFilter, since: i64) -> Result<LogStat, StoreError> {
        let filter = LogFilter {
            log_type: Some(LogType::Consume.as_i32()),
            ..filter.clone()
        };
        let logs = self.logs.read().map_err(poisoned)?;
        let mut stat = LogStat::default();
        for entry in logs.iter().filter(|entry| filter.matches(entry)) {
            stat.quota += entry.quota;
            if entry.created_at >= since {
                stat.rpm += 1;
                stat.tpm += entry.prompt_tokens + entry.completion_tokens;
            }
        }
        Ok(stat)
    }
}
