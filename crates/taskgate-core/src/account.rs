use std::sync::Arc;

use argon2::Argon2;
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use serde::{Deserialize, Deserializer};
use serde_json::Value as JsonValue;
use tracing::info;

use crate::error::{AccountError, StoreError};
use crate::store::{ACCOUNT_STATUS_ENABLED, AccountRecord, AccountStore};
use crate::unix_now;

pub const MAX_USERNAME_CHARS: usize = 30;
pub const MIN_PASSWORD_CHARS: usize = 8;
pub const MAX_PASSWORD_CHARS: usize = 30;
pub const DEFAULT_GROUP: &str = "default";

#[derive(Debug, Clone, Deserialize)]
pub struct ProvisionRequest {
    pub id: i64,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnsureRequest {
    #[serde(deserialize_with = "int_or_string")]
    pub user_id: i64,
    pub user_name: String,
}

/// External systems send ids either as JSON numbers or as numeric strings.
fn int_or_string<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    match JsonValue::deserialize(deserializer)? {
        JsonValue::Number(number) => number
            .as_i64()
            .ok_or_else(|| serde::de::Error::custom("user_id must be an integer")),
        JsonValue::String(text) => text
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom("user_id must be an integer")),
        _ => Err(serde::de::Error::custom("user_id must be an integer")),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    Existing,
    Created,
}

pub fn hash_password(password: &str) -> Result<String, AccountError> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|err| AccountError::PasswordHash(err.to_string()))?;
    Ok(hash.to_string())
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    PasswordHash::new(hash)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

#[derive(Clone)]
pub struct AccountService {
    accounts: Arc<dyn AccountStore>,
}

impl AccountService {
    pub fn new(accounts: Arc<dyn AccountStore>) -> Self {
        Self { accounts }
    }

    /// Create an account with a caller-chosen id. Usernames held by
    /// soft-deleted accounts count as taken.
    pub async fn provision(&self, request: ProvisionRequest) -> Result<AccountRecord, AccountError> {
        let username_len = request.username.chars().count();
        if request.id <= 0 {
            return Err(AccountError::InvalidInput("id must be positive".to_string()));
        }
        if username_len == 0 || username_len > MAX_USERNAME_CHARS {
            return Err(AccountError::InvalidInput(format!(
                "username must be 1 to {MAX_USERNAME_CHARS} characters"
            )));
        }
        let password_len = request.password.chars().count();
        if !(MIN_PASSWORD_CHARS..=MAX_PASSWORD_CHARS).contains(&password_len) {
            return Err(AccountError::InvalidInput(format!(
                "password must be {MIN_PASSWORD_CHARS} to {MAX_PASSWORD_CHARS} characters"
            )));
        }
        if self.accounts.username_taken(&request.username).await? {
            return Err(AccountError::AlreadyExists);
        }
        self.create(request.id, &request.username, &request.password)
            .await
    }

    /// Look the account up by id and create it when missing, using the name
    /// as the initial password. An id held by a soft-deleted account counts
    /// as existing.
    pub async fn ensure(&self, request: EnsureRequest) -> Result<EnsureOutcome, AccountError> {
        if request.user_id <= 0 {
            return Err(AccountError::InvalidInput("user_id must be positive".to_string()));
        }
        let name_len = request.user_name.chars().count();
        if name_len == 0 || name_len > MAX_USERNAME_CHARS {
            return Err(AccountError::InvalidInput(format!(
                "user_name must be 1 to {MAX_USERNAME_CHARS} characters"
            )));
        }
        if self.accounts.account_id_taken(request.user_id).await? {
            return Ok(EnsureOutcome::Existing);
        }
        self.create(request.user_id, &request.user_name, &request.user_name)
            .await?;
        Ok(EnsureOutcome::Created)
    }

    async fn create(
        &self,
        id: i64,
        username: &str,
        password: &str,
    ) -> Result<AccountRecord, AccountError> {
        let account = AccountRecord {
            id,
            username: username.to_string(),
            display_name: username.to_string(),
            password: hash_password(password)?,
            status: ACCOUNT_STATUS_ENABLED,
            quota: 0,
            used_quota: 0,
            request_count: 0,
            group: DEFAULT_GROUP.to_string(),
            created_at: unix_now(),
            deleted_at: None,
        };
        let account = match self.accounts.insert_account(account).await {
            Ok(account) => account,
            Err(StoreError::Conflict(_)) => return Err(AccountError::AlreadyExists),
            Err(err) => return Err(err.into()),
        };
        info!(event = "account_created", user_id = account.id, username = %account.username);
        Ok(account)
    }
}
