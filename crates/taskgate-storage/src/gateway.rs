use async_trait::async_trait;
use sea_orm::entity::prelude::*;
use sea_orm::sea_query::{Alias, Expr, ExprTrait, Func};
use sea_orm::{
    ActiveValue, Database, DatabaseConnection, DbBackend, DbErr, PaginatorTrait, QueryOrder,
    QuerySelect, Schema, Select, SqlErr, TransactionTrait,
};
use tracing::warn;

use taskgate_core::error::StoreError;
use taskgate_core::store::{
    AccountRecord, AccountStore, LogFilter, LogStat, LogType, TaskRecord, TaskStore, TaskUpdate,
    TokenRecord, TokenStatus, TokenStore, UsageLogRecord, UsageLogStore,
};
use taskgate_protocol::task::TaskStatus;

use crate::entities;

/// Relational backend for every gateway store, on any database sea-orm speaks.
#[derive(Clone)]
pub struct GatewayStorage {
    db: DatabaseConnection,
}

impl GatewayStorage {
    pub async fn connect(database_url: &str) -> Result<Self, DbErr> {
        let db = Database::connect(database_url).await?;
        Ok(Self { db })
    }

    pub async fn from_connection(db: DatabaseConnection) -> Result<Self, DbErr> {
        Ok(Self { db })
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    pub async fn sync(&self) -> Result<(), DbErr> {
        Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::Users)
            .register(entities::Tokens)
            .register(entities::Tasks)
            .register(entities::UsageLogs)
            .sync(&self.db)
            .await
    }
}

fn backend(err: DbErr) -> StoreError {
    StoreError::Backend(err.to_string())
}

/// `CAST(COALESCE(expr, 0) AS <64-bit int>)`, so aggregates decode as `i64`
/// on every backend.
fn as_bigint(backend: DbBackend, expr: Expr) -> Expr {
    let target = match backend {
        DbBackend::MySql => "SIGNED",
        _ => "BIGINT",
    };
    Func::cast_as(Func::coalesce([expr, Expr::value(0)]), Alias::new(target)).into()
}

fn insert_failed(err: DbErr, what: &str) -> StoreError {
    match err.sql_err() {
        Some(SqlErr::UniqueConstraintViolation(_)) => StoreError::Conflict(what.to_string()),
        _ => backend(err),
    }
}

#[async_trait]
impl TaskStore for GatewayStorage {
    async fn insert_task(&self, task: TaskRecord) -> Result<(), StoreError> {
        let active: entities::tasks::ActiveModel = task.into();
        entities::Tasks::insert(active)
            .exec_without_returning(&self.db)
            .await
            .map_err(|err| insert_failed(err, "task id"))?;
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        let model = entities::Tasks::find_by_id(task_id.to_string())
            .one(&self.db)
            .await
            .map_err(backend)?;
        Ok(model.map(TaskRecord::from))
    }

    async fn update_task_if(
        &self,
        task_id: &str,
        allowed: &[TaskStatus],
        update: TaskUpdate,
    ) -> Result<bool, StoreError> {
        use entities::tasks::Column;

        if allowed.is_empty() {
            return Ok(false);
        }
        let active = entities::tasks::ActiveModel {
            status: ActiveValue::Set(update.status.as_str().to_string()),
            progress: ActiveValue::Set(update.progress),
            task_data: ActiveValue::Set(update.task_data),
            result_url: ActiveValue::Set(update.result_url),
            fail_reason: ActiveValue::Set(update.fail_reason),
            start_time: ActiveValue::Set(update.start_time),
            finish_time: ActiveValue::Set(update.finish_time),
            updated_at: ActiveValue::Set(update.updated_at),
            ..Default::default()
        };
        let result = entities::Tasks::update_many()
            .set(active)
            .filter(Column::TaskId.eq(task_id))
            .filter(Column::Status.is_in(allowed.iter().map(|status| status.as_str())))
            .exec(&self.db)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected > 0)
    }

    async fn settle_charge(&self, task_id: &str) -> Result<bool, StoreError> {
        use entities::tasks::Column;

        let txn = self.db.begin().await.map_err(backend)?;
        let claimed = entities::Tasks::update_many()
            .col_expr(Column::Charged, Expr::value(true))
            .filter(Column::TaskId.eq(task_id))
            .filter(Column::Status.eq(TaskStatus::Success.as_str()))
            .filter(Column::Charged.eq(false))
            .exec(&txn)
            .await
            .map_err(backend)?;
        if claimed.rows_affected == 0 {
            return Ok(false);
        }
        let task = entities::Tasks::find_by_id(task_id.to_string())
            .one(&txn)
            .await
            .map_err(backend)?
            .ok_or_else(|| StoreError::Backend(format!("task {task_id} vanished")))?;

        {
            use entities::users::Column;

            let debited = entities::Users::update_many()
                .col_expr(Column::Quota, Expr::col(Column::Quota).sub(task.quota))
                .col_expr(Column::UsedQuota, Expr::col(Column::UsedQuota).add(task.quota))
                .col_expr(Column::RequestCount, Expr::col(Column::RequestCount).add(1))
                .filter(Column::Id.eq(task.user_id))
                .filter(Column::DeletedAt.is_null())
                .exec(&txn)
                .await
                .map_err(backend)?;
            if debited.rows_affected == 0 {
                // Dropping the transaction rolls the claim back.
                return Err(StoreError::Backend(format!("user {} not found", task.user_id)));
            }
        }

        if let Some(token_id) = task.token_id {
            use entities::tokens::Column;

            entities::Tokens::update_many()
                .col_expr(Column::UsedQuota, Expr::col(Column::UsedQuota).add(task.quota))
                .filter(Column::Id.eq(token_id))
                .exec(&txn)
                .await
                .map_err(backend)?;
            entities::Tokens::update_many()
                .col_expr(Column::RemainQuota, Expr::col(Column::RemainQuota).sub(task.quota))
                .filter(Column::Id.eq(token_id))
                .filter(Column::UnlimitedQuota.eq(false))
                .exec(&txn)
                .await
                .map_err(backend)?;
        }
        txn.commit().await.map_err(backend)?;
        Ok(true)
    }
}

#[async_trait]
impl AccountStore for GatewayStorage {
    async fn get_account(&self, id: i64) -> Result<Option<AccountRecord>, StoreError> {
        use entities::users::Column;

        let model = entities::Users::find_by_id(id)
            .filter(Column::DeletedAt.is_null())
            .one(&self.db)
            .await
            .map_err(backend)?;
        Ok(model.map(AccountRecord::from))
    }

    async fn username_taken(&self, username: &str) -> Result<bool, StoreError> {
        use entities::users::Column;

        let count = entities::Users::find()
            .filter(Column::Username.eq(username))
            .count(&self.db)
            .await
            .map_err(backend)?;
        Ok(count > 0)
    }

    async fn insert_account(&self, account: AccountRecord) -> Result<AccountRecord, StoreError> {
        let active: entities::users::ActiveModel = account.clone().into();
        entities::Users::insert(active)
            .exec(&self.db)
            .await
            .map_err(|err| insert_failed(err, "user"))?;
        Ok(account)
    }

    async fn adjust_quota(
        &self,
        id: i64,
        delta: i64,
    ) -> Result<Option<AccountRecord>, StoreError> {
        use entities::users::Column;

        let result = entities::Users::update_many()
            .col_expr(Column::Quota, Expr::col(Column::Quota).add(delta))
            .filter(Column::Id.eq(id))
            .filter(Column::DeletedAt.is_null())
            .exec(&self.db)
            .await
            .map_err(backend)?;
        if result.rows_affected == 0 {
            return Ok(None);
        }
        self.get_account(id).await
    }

    async fn account_id_taken(&self, id: i64) -> Result<bool, StoreError> {
        let count = entities::Users::find_by_id(id)
            .count(&self.db)
            .await
            .map_err(backend)?;
        Ok(count > 0)
    }
}

#[async_trait]
impl TokenStore for GatewayStorage {
    async fn insert_token(&self, mut token: TokenRecord) -> Result<TokenRecord, StoreError> {
        let mut active: entities::tokens::ActiveModel = token.clone().into();
        active.id = ActiveValue::NotSet;
        let result = entities::Tokens::insert(active)
            .exec(&self.db)
            .await
            .map_err(|err| insert_failed(err, "token key"))?;
        token.id = result.last_insert_id;
        Ok(token)
    }

    async fn get_token(&self, id: i64) -> Result<Option<TokenRecord>, StoreError> {
        let model = entities::Tokens::find_by_id(id)
            .one(&self.db)
            .await
            .map_err(backend)?;
        model.map(TokenRecord::try_from).transpose()
    }

    async fn get_token_by_key(&self, key: &str) -> Result<Option<TokenRecord>, StoreError> {
        use entities::tokens::Column;

        let model = entities::Tokens::find()
            .filter(Column::Key.eq(key))
            .one(&self.db)
            .await
            .map_err(backend)?;
        model.map(TokenRecord::try_from).transpose()
    }

    async fn update_token(&self, token: &TokenRecord) -> Result<(), StoreError> {
        let active: entities::tokens::ActiveModel = token.clone().into();
        entities::Tokens::update(active)
            .exec(&self.db)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn set_token_status(&self, id: i64, status: TokenStatus) -> Result<(), StoreError> {
        use entities::tokens::Column;

        entities::Tokens::update_many()
            .col_expr(Column::Status, Expr::value(status.as_i32()))
            .filter(Column::Id.eq(id))
            .exec(&self.db)
            .await
            .map_err(backend)?;
        Ok(())
    }
}

fn filtered_logs(filter: &LogFilter) -> Select<entities::UsageLogs> {
    use entities::usage_logs::Column;

    fn wanted(value: &Option<String>) -> Option<&str> {
        value.as_deref().filter(|value| !value.is_empty())
    }

    let mut select = entities::UsageLogs::find();
    if let Some(log_type) = filter.log_type {
        select = select.filter(Column::LogType.eq(log_type));
    }
    if let Some(user_id) = filter.user_id {
        select = select.filter(Column::UserId.eq(user_id));
    }
    if let Some(channel_id) = filter.channel_id {
        select = select.filter(Column::ChannelId.eq(channel_id));
    }
    if let Some(start) = filter.start_timestamp {
        select = select.filter(Column::CreatedAt.gte(start));
    }
    if let Some(end) = filter.end_timestamp {
        select = select.filter(Column::CreatedAt.lte(end));
    }
    if let Some(username) = wanted(&filter.username) {
        select = select.filter(Column::Username.eq(username));
    }
    if let Some(token_name) = wanted(&filter.token_name) {
        select = select.filter(Column::TokenName.eq(token_name));
    }
    if let Some(model_name) = wanted(&filter.model_name) {
        select = select.filter(Column::ModelName.eq(model_name));
    }
    if let Some(group) = wanted(&filter.group) {
        select = select.filter(Column::Group.eq(group));
    }
    select
}

#[async_trait]
impl UsageLogStore for GatewayStorage {
    async fn append_log(&self, entry: UsageLogRecord) -> Result<(), StoreError> {
        let mut active: entities::usage_logs::ActiveModel = entry.into();
        active.id = ActiveValue::NotSet;
        entities::UsageLogs::insert(active)
            .exec(&self.db)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn query_logs(
        &self,
        filter: &LogFilter,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<UsageLogRecord>, u64), StoreError> {
        use entities::usage_logs::Column;

        let select = filtered_logs(filter);
        let total = select.clone().count(&self.db).await.map_err(backend)?;
        let rows = select
            .order_by_desc(Column::Id)
            .offset(offset)
            .limit(limit)
            .all(&self.db)
            .await
            .map_err(backend)?;
        Ok((rows.into_iter().map(UsageLogRecord::from).collect(), total))
    }

    async fn stat_logs(&self, filter: &LogFilter, since: i64) -> Result<LogStat, StoreError> {
        use entities::usage_logs::Column;

        let filter = LogFilter {
            log_type: Some(LogType::Consume.as_i32()),
            ..filter.clone()
        };
        let db_backend = self.db.get_database_backend();
        let quota: Option<i64> = filtered_logs(&filter)
            .select_only()
            .column_as(
                as_bigint(db_backend, Func::sum(Expr::col(Column::Quota)).into()),
                "quota",
            )
            .into_tuple()
            .one(&self.db)
            .await
            .map_err(backend)?;
        let recent: Option<(i64, i64)> = filtered_logs(&filter)
            .filter(Column::CreatedAt.gte(since))
            .select_only()
            .column_as(
                as_bigint(db_backend, Func::count(Expr::col(Column::Id)).into()),
                "rpm",
            )
            .column_as(
                as_bigint(
                    db_backend,
                    Func::sum(Expr::col(Column::PromptTokens).add(Expr::col(Column::CompletionTokens)))
                        .into(),
                ),
                "tpm",
            )
            .into_tuple()
            .one(&self.db)
            .await
            .map_err(backend)?;
        let (rpm, tpm) = recent.unwrap_or_default();
        Ok(LogStat {
            quota: quota.unwrap_or_default(),
            rpm,
            tpm,
        })
    }
}

impl From<TaskRecord> for entities::tasks::ActiveModel {
    fn from(task: TaskRecord) -> Self {
        entities::tasks::ActiveModel {
            task_id: ActiveValue::Set(task.task_id),
            channel_id: ActiveValue::Set(task.channel_id),
            platform: ActiveValue::Set(task.platform),
            user_id: ActiveValue::Set(task.user_id),
            token_id: ActiveValue::Set(task.token_id),
            action: ActiveValue::Set(task.action),
            model: ActiveValue::Set(task.model),
            status: ActiveValue::Set(task.status.as_str().to_string()),
            progress: ActiveValue::Set(task.progress),
            request_payload: ActiveValue::Set(task.request_payload),
            task_data: ActiveValue::Set(task.task_data),
            result_url: ActiveValue::Set(task.result_url),
            fail_reason: ActiveValue::Set(task.fail_reason),
            quota: ActiveValue::Set(task.quota),
            charged: ActiveValue::Set(task.charged),
            submit_time: ActiveValue::Set(task.submit_time),
            start_time: ActiveValue::Set(task.start_time),
            finish_time: ActiveValue::Set(task.finish_time),
            created_at: ActiveValue::Set(task.created_at),
            updated_at: ActiveValue::Set(task.updated_at),
        }
    }
}

impl From<entities::tasks::Model> for TaskRecord {
    fn from(model: entities::tasks::Model) -> Self {
        TaskRecord {
            task_id: model.task_id,
            channel_id: model.channel_id,
            platform: model.platform,
            user_id: model.user_id,
            token_id: model.token_id,
            action: model.action,
            model: model.model,
            status: TaskStatus::parse(&model.status),
            progress: model.progress,
            request_payload: model.request_payload,
            task_data: model.task_data,
            result_url: model.result_url,
            fail_reason: model.fail_reason,
            quota: model.quota,
            charged: model.charged,
            submit_time: model.submit_time,
            start_time: model.start_time,
            finish_time: model.finish_time,
            created_at: model.created_at,
            updated_at: model.updated_at,
        }
    }
}

impl From<AccountRecord> for entities::users::ActiveModel {
    fn from(account: AccountRecord) -> Self {
        entities::users::ActiveModel {
            id: ActiveValue::Set(account.id),
            username: ActiveValue::Set(account.username),
            display_name: ActiveValue::Set(account.display_name),
            password: ActiveValue::Set(account.password),
            status: ActiveValue::Set(account.status),
            quota: ActiveValue::Set(account.quota),
            used_quota: ActiveValue::Set(account.used_quota),
            request_count: ActiveValue::Set(account.request_count),
            group: ActiveValue::Set(account.group),
            created_at: ActiveValue::Set(account.created_at),
            deleted_at: ActiveValue::Set(account.deleted_at),
        }
    }
}

impl From<entities::users::Model> for AccountRecord {
    fn from(model: entities::users::Model) -> Self {
        AccountRecord {
            id: model.id,
            username: model.username,
            display_name: model.display_name,
            password: model.password,
            status: model.status,
            quota: model.quota,
            used_quota: model.used_quota,
            request_count: model.request_count,
            group: model.group,
            created_at: model.created_at,
            deleted_at: model.deleted_at,
        }
    }
}

impl From<TokenRecord> for entities::tokens::ActiveModel {
    fn from(token: TokenRecord) -> Self {
        entities::tokens::ActiveModel {
            id: ActiveValue::Set(token.id),
            key: ActiveValue::Set(token.key),
            user_id: ActiveValue::Set(token.user_id),
            name: ActiveValue::Set(token.name),
            status: ActiveValue::Set(token.status.as_i32()),
            remain_quota: ActiveValue::Set(token.remain_quota),
            unlimited_quota: ActiveValue::Set(token.unlimited_quota),
            used_quota: ActiveValue::Set(token.used_quota),
            expired_time: ActiveValue::Set(token.expired_time),
            model_limits_enabled: ActiveValue::Set(token.model_limits_enabled),
            model_limits: ActiveValue::Set(token.model_limits),
            allow_ips: ActiveValue::Set(token.allow_ips),
            group: ActiveValue::Set(token.group),
            created_time: ActiveValue::Set(token.created_time),
            accessed_time: ActiveValue::Set(token.accessed_time),
        }
    }
}

impl TryFrom<entities::tokens::Model> for TokenRecord {
    type Error = StoreError;

    fn try_from(model: entities::tokens::Model) -> Result<Self, Self::Error> {
        let status = TokenStatus::try_from(model.status).map_err(StoreError::Backend)?;
        Ok(TokenRecord {
            id: model.id,
            key: model.key,
            user_id: model.user_id,
            name: model.name,
            status,
            remain_quota: model.remain_quota,
            unlimited_quota: model.unlimited_quota,
            used_quota: model.used_quota,
            expired_time: model.expired_time,
            model_limits_enabled: model.model_limits_enabled,
            model_limits: model.model_limits,
            allow_ips: model.allow_ips,
            group: model.group,
            created_time: model.created_time,
            accessed_time: model.accessed_time,
        })
    }
}

impl From<UsageLogRecord> for entities::usage_logs::ActiveModel {
    fn from(entry: UsageLogRecord) -> Self {
        entities::usage_logs::ActiveModel {
            id: ActiveValue::Set(entry.id),
            user_id: ActiveValue::Set(entry.user_id),
            username: ActiveValue::Set(entry.username),
            created_at: ActiveValue::Set(entry.created_at),
            log_type: ActiveValue::Set(entry.log_type.as_i32()),
            content: ActiveValue::Set(entry.content),
            token_name: ActiveValue::Set(entry.token_name),
            model_name: ActiveValue::Set(entry.model_name),
            quota: ActiveValue::Set(entry.quota),
            prompt_tokens: ActiveValue::Set(entry.prompt_tokens),
            completion_tokens: ActiveValue::Set(entry.completion_tokens),
            use_time: ActiveValue::Set(entry.use_time),
            is_stream: ActiveValue::Set(entry.is_stream),
            channel_id: ActiveValue::Set(entry.channel_id),
            token_id: ActiveValue::Set(entry.token_id),
            group: ActiveValue::Set(entry.group),
            ip: ActiveValue::Set(entry.ip),
        }
    }
}

impl From<entities::usage_logs::Model> for UsageLogRecord {
    fn from(model: entities::usage_logs::Model) -> Self {
        let log_type = LogType::try_from(model.log_type).unwrap_or_else(|err| {
            warn!(event = "usage_log_decode", id = model.id, error = %err);
            LogType::Unknown
        });
        UsageLogRecord {
            id: model.id,
            user_id: model.user_id,
            created_at: model.created_at,
            log_type,
            content: model.content,
            username: model.username,
            token_name: model.token_name,
            model_name: model.model_name,
            quota: model.quota,
            prompt_tokens: model.prompt_tokens,
            completion_tokens: model.completion_tokens,
            use_time: model.use_time,
            is_stream: model.is_stream,
            channel_id: model.channel_id,
            token_id: model.token_id,
            group: model.group,
            ip: model.ip,
        }
    }
}
