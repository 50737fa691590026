use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::macros::format_description;
use tracing::{info, warn};

use crate::error::LedgerError;
use crate::store::{
    AccountRecord, AccountStore, LogFilter, LogStat, LogType, TaskRecord, TaskStore, TokenStore,
    UsageLogRecord, UsageLogStore,
};
use crate::unix_now;

pub const DEFAULT_UNITS_PER_DOLLAR: i64 = 500_000;
pub const DEFAULT_YUAN_PER_DOLLAR: f64 = 7.3;
pub const MIN_TOPUP_YUAN: f64 = 0.01;
/// Largest single credit, in units.
pub const MAX_TOPUP_UNITS: i64 = 1_000_000_000_000_000;
pub const DEFAULT_PAGE_SIZE: u64 = 10;
pub const MAX_PAGE_SIZE: u64 = 100;
const RATE_WINDOW_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaRates {
    pub units_per_dollar: i64,
    pub yuan_per_dollar: f64,
}

impl Default for QuotaRates {
    fn default() -> Self {
        Self {
            units_per_dollar: DEFAULT_UNITS_PER_DOLLAR,
            yuan_per_dollar: DEFAULT_YUAN_PER_DOLLAR,
        }
    }
}

impl QuotaRates {
    /// `None` when the amount does not fit in a single credit.
    pub fn units_for_yuan(&self, yuan: f64) -> Option<i64> {
        let units = (yuan / self.yuan_per_dollar * self.units_per_dollar as f64).floor();
        if !units.is_finite() || units < 0.0 || units > MAX_TOPUP_UNITS as f64 {
            return None;
        }
        Some(units as i64)
    }

    pub fn dollars(&self, units: i64) -> f64 {
        units as f64 / self.units_per_dollar as f64
    }

    /// Yuan rounded to cents.
    pub fn yuan(&self, units: i64) -> f64 {
        (self.dollars(units) * self.yuan_per_dollar * 100.0).round() / 100.0
    }
}

#[derive(Debug, Clone)]
pub struct TopupOutcome {
    pub account: AccountRecord,
    pub added: i64,
    /// Set when the balance moved but the audit entry could not be written.
    pub log_warning: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountSummary {
    pub id: i64,
    pub username: String,
    pub request_count: i64,
    pub quota: i64,
    pub used_quota: i64,
    pub quota_dollar: f64,
    pub used_quota_dollar: f64,
    pub quota_rmb: f64,
    pub used_quota_rmb: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PageQuery {
    pub p: u64,
    pub page_size: u64,
}

impl PageQuery {
    pub fn normalized(self) -> Self {
        let page_size = match self.page_size {
            0 => DEFAULT_PAGE_SIZE,
            size => size.min(MAX_PAGE_SIZE),
        };
        Self {
            p: self.p.max(1),
            page_size,
        }
    }

    pub fn offset(&self) -> u64 {
        self.p.saturating_sub(1) * self.page_size
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogItem {
    #[serde(flatten)]
    pub entry: UsageLogRecord,
    #[serde(rename = "createTime")]
    pub create_time: String,
    pub quota_dollar: f64,
    pub quota_rmb: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogPage {
    pub page: u64,
    pub page_size: u64,
    pub total: u64,
    pub items: Vec<LogItem>,
}

pub fn format_create_time(timestamp: i64) -> String {
    let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    OffsetDateTime::from_unix_timestamp(timestamp)
        .ok()
        .and_then(|when| when.format(&format).ok())
        .unwrap_or_default()
}

#[derive(Clone)]
pub struct QuotaLedger {
    tasks: Arc<dyn TaskStore>,
    accounts: Arc<dyn AccountStore>,
    tokens: Arc<dyn TokenStore>,
    logs: Arc<dyn UsageLogStore>,
    rates: QuotaRates,
}

impl QuotaLedger {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        accounts: Arc<dyn AccountStore>,
        tokens: Arc<dyn TokenStore>,
        logs: Arc<dyn UsageLogStore>,
        rates: QuotaRates,
    ) -> Self {
        Self {
            tasks,
            accounts,
            tokens,
            logs,
            rates,
        }
    }

    pub fn rates(&self) -> QuotaRates {
        self.rates
    }

    /// Credit `yuan` to the account. The balance change is the primary
    /// mutation; the audit entry is best effort.
    pub async fn topup(&self, user_id: i64, yuan: f64, ip: &str) -> Result<TopupOutcome, LedgerError> {
        if user_id <= 0 {
            return Err(LedgerError::InvalidUserId);
        }
        if !yuan.is_finite() || yuan < MIN_TOPUP_YUAN {
            return Err(LedgerError::InvalidAmount);
        }
        let added = self
            .rates
            .units_for_yuan(yuan)
            .ok_or(LedgerError::InvalidAmount)?;
        let account = self
            .accounts
            .adjust_quota(user_id, added)
            .await?
            .ok_or(LedgerError::AccountNotFound)?;
        info!(
            event = "quota_topup",
            user_id = user_id,
            added = added,
            quota = account.quota
        );

        let entry = UsageLogRecord {
            user_id,
            username: account.username.clone(),
            created_at: unix_now(),
            log_type: LogType::Topup,
            content: format!("top up {yuan:.0} yuan, got {added} units"),
            quota: added,
            model_name: "system".to_string(),
            ip: ip.to_string(),
            ..UsageLogRecord::default()
        };
        let log_warning = match self.logs.append_log(entry).await {
            Ok(()) => None,
            Err(err) => {
                warn!(event = "audit_log_failed", op = "topup", user_id = user_id, error = %err);
                Some(format!("top up applied but audit log failed: {err}"))
            }
        };

        Ok(TopupOutcome {
            account,
            added,
            log_warning,
        })
    }

    pub async fn summary(&self, user_id: i64) -> Result<AccountSummary, LedgerError> {
        if user_id <= 0 {
            return Err(LedgerError::InvalidUserId);
        }
        let account = self
            .accounts
            .get_account(user_id)
            .await?
            .ok_or(LedgerError::AccountNotFound)?;
        Ok(AccountSummary {
            id: account.id,
            username: account.username,
            request_count: account.request_count,
            quota: account.quota,
            used_quota: account.used_quota,
            quota_dollar: self.rates.dollars(account.quota),
            used_quota_dollar: self.rates.dollars(account.used_quota),
            quota_rmb: self.rates.yuan(account.quota),
            used_quota_rmb: self.rates.yuan(account.used_quota),
        })
    }

    /// Consumption aggregate. A `user_id` is resolved to its username; an
    /// unknown id leaves the username filter empty.
    pub async fn stat(&self, user_id: Option<i64>, mut filter: LogFilter) -> Result<LogStat, LedgerError> {
        let mut username = String::new();
        if let Some(user_id) = user_id.filter(|id| *id > 0) {
            if let Some(account) = self.accounts.get_account(user_id).await? {
                username = account.username;
            }
        }
        filter.username = Some(username);
        filter.user_id = None;
        let since = unix_now() - RATE_WINDOW_SECS;
        Ok(self.logs.stat_logs(&filter, since).await?)
    }

    pub async fn logs(&self, filter: &LogFilter, page: PageQuery) -> Result<LogPage, LedgerError> {
        let page = page.normalized();
        let (entries, total) = self
            .logs
            .query_logs(filter, page.offset(), page.page_size)
            .await?;
        let items = entries
            .into_iter()
            .map(|entry| LogItem {
                create_time: format_create_time(entry.created_at),
                quota_dollar: self.rates.dollars(entry.quota),
                quota_rmb: self.rates.yuan(entry.quota),
                entry,
            })
            .collect();
        Ok(LogPage {
            page: page.p,
            page_size: page.page_size,
            total,
            items,
        })
    }

    /// Settle a successful task against its account and token, then write
    /// the consumption entry. Returns `false` when the task is not payable or
    /// was already settled; on error nothing was debited and the call can be
    /// repeated.
    pub async fn charge_task(&self, task: &TaskRecord) -> Result<bool, LedgerError> {
        if !self.tasks.settle_charge(&task.task_id).await? {
            return Ok(false);
        }
        info!(
            event = "quota_charge",
            task_id = %task.task_id,
            user_id = task.user_id,
            quota = task.quota
        );

        let mut token_name = String::new();
        if let Some(token_id) = task.token_id {
            if let Ok(Some(token)) = self.tokens.get_token(token_id).await {
                token_name = token.name;
            }
        }
        let username = match self.accounts.get_account(task.user_id).await {
            Ok(Some(account)) => account.username,
            _ => String::new(),
        };
        let entry = UsageLogRecord {
            user_id: task.user_id,
            username,
            created_at: unix_now(),
            log_type: LogType::Consume,
            content: format!("{} task {} succeeded", task.action, task.task_id),
            token_name,
            model_name: task.model.clone(),
            quota: task.quota,
            use_time: (task.finish_time - task.submit_time).max(0),
            channel_id: task.channel_id,
            token_id: task.token_id.unwrap_or_default(),
            ..UsageLogRecord::default()
        };
        if let Err(err) = self.logs.append_log(entry).await {
            warn!(event = "audit_log_failed", op = "charge", task_id = %task.task_id, error = %err);
        }
        Ok(true)
    }
}
