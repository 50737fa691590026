use std::sync::Arc;

use rand::Rng;
use rand::distr::Alphanumeric;
use serde::Deserialize;
use tracing::info;

use crate::error::TokenError;
use crate::store::{AccountStore, TokenRecord, TokenStatus, TokenStore};
use crate::unix_now;

pub const KEY_LENGTH: usize = 48;
pub const MAX_NAME_CHARS: usize = 30;

/// Editable token fields as sent by the external system.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TokenInput {
    pub user_id: i64,
    pub name: String,
    pub status: Option<TokenStatus>,
    pub expired_time: i64,
    pub remain_quota: i64,
    pub unlimited_quota: bool,
    pub model_limits_enabled: bool,
    pub model_limits: String,
    pub allow_ips: Option<String>,
    pub group: String,
}

pub fn generate_key() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(KEY_LENGTH)
        .map(char::from)
        .collect()
}

#[derive(Clone)]
pub struct TokenService {
    tokens: Arc<dyn TokenStore>,
    accounts: Arc<dyn AccountStore>,
}

impl TokenService {
    pub fn new(tokens: Arc<dyn TokenStore>, accounts: Arc<dyn AccountStore>) -> Self {
        Self { tokens, accounts }
    }

    /// Create an enabled token for an existing account and return its key.
    pub async fn issue(&self, input: TokenInput) -> Result<String, TokenError> {
        if input.user_id <= 0 {
            return Err(TokenError::InvalidUserId);
        }
        if self.accounts.get_account(input.user_id).await?.is_none() {
            return Err(TokenError::UserNotFound);
        }
        if input.name.chars().count() > MAX_NAME_CHARS {
            return Err(TokenError::NameTooLong);
        }

        let now = unix_now();
        let token = TokenRecord {
            id: 0,
            key: generate_key(),
            user_id: input.user_id,
            name: input.name,
            status: TokenStatus::Enabled,
            remain_quota: input.remain_quota,
            unlimited_quota: input.unlimited_quota,
            used_quota: 0,
            expired_time: input.expired_time,
            model_limits_enabled: input.model_limits_enabled,
            model_limits: input.model_limits,
            allow_ips: input.allow_ips,
            group: input.group,
            created_time: now,
            accessed_time: now,
        };
        let token = self.tokens.insert_token(token).await?;
        info!(event = "token_issued", user_id = token.user_id, token_id = token.id);
        Ok(token.key)
    }

    /// Update the token behind `key`. With `status_only` only the status is
    /// copied; otherwise every editable field is overwritten.
    pub async fn update(
        &self,
        key: &str,
        status_only: bool,
        input: TokenInput,
    ) -> Result<TokenRecord, TokenError> {
        if key.is_empty() {
            return Err(TokenError::MissingKey);
        }
        let mut token = self
            .tokens
            .get_token_by_key(key)
            .await?
            .ok_or(TokenError::InvalidToken)?;

        let requested = input.status.unwrap_or(token.status);
        if requested == TokenStatus::Enabled {
            let now = unix_now();
            if token.status == TokenStatus::Expired && token.is_expired_at(now) {
                return Err(TokenError::CannotEnableExpired);
            }
            if token.status == TokenStatus::Exhausted && token.is_exhausted() {
                return Err(TokenError::CannotEnableExhausted);
            }
        }

        if status_only {
            token.status = requested;
        } else {
            if input.name.chars().count() > MAX_NAME_CHARS {
                return Err(TokenError::NameTooLong);
            }
            token.name = input.name;
            token.expired_time = input.expired_time;
            token.remain_quota = input.remain_quota;
            token.unlimited_quota = input.unlimited_quota;
            token.model_limits_enabled = input.model_limits_enabled;
            token.model_limits = input.model_limits;
            token.allow_ips = input.allow_ips;
            token.group = input.group;
            token.status = requested;
        }

        self.tokens.update_token(&token).await?;
        info!(
            event = "token_updated",
            token_id = token.id,
            status = token.status.as_i32(),
            status_only = status_only
        );
        Ok(token)
    }

    pub async fn validate_key(&self, key: &str, now: i64) -> Result<TokenRecord, TokenError> {
        let token = self
            .tokens
            .get_token_by_key(key)
            .await?
            .ok_or(TokenError::InvalidToken)?;
        self.validate(token, now).await
    }

    pub async fn validate_id(&self, id: i64, now: i64) -> Result<TokenRecord, TokenError> {
        let token = self
            .tokens
            .get_token(id)
            .await?
            .ok_or(TokenError::InvalidToken)?;
        self.validate(token, now).await
    }

    /// Derive the effective status at `now`, persisting expired/exhausted
    /// transitions as they are discovered.
    async fn validate(&self, token: TokenRecord, now: i64) -> Result<TokenRecord, TokenError> {
        match token.status {
            TokenStatus::Enabled => {}
            TokenStatus::Disabled => return Err(TokenError::Disabled),
            TokenStatus::Expired => return Err(TokenError::Expired),
            TokenStatus::Exhausted => return Err(TokenError::Exhausted),
        }
        if token.is_expired_at(now) {
            self.tokens
                .set_token_status(token.id, TokenStatus::Expired)
                .await?;
            return Err(TokenError::Expired);
        }
        if token.is_exhausted() {
            self.tokens
                .set_token_status(token.id, TokenStatus::Exhausted)
                .await?;
            return Err(TokenError::Exhausted);
        }
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    use crate::store::{ACCOUNT_STATUS_ENABLED, AccountRecord, MemoryStore};

    async fn service_with_user() -> (TokenService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::default());
        store
            .insert_account(AccountRecord {
                id: 7,
                username: "alice".to_string(),
                display_name: "alice".to_string(),
                password: String::new(),
                status: ACCOUNT_STATUS_ENABLED,
                quota: 0,
                used_quota: 0,
                request_count: 0,
                group: "default".to_string(),
                created_at: 0,
                deleted_at: None,
            })
            .await
            .unwrap();
        (TokenService::new(store.clone(), store.clone()), store)
    }

    fn input(name: &str) -> TokenInput {
        TokenInput {
            user_id: 7,
            name: name.to_string(),
            expired_time: -1,
            remain_quota: 1000,
            ..TokenInput::default()
        }
    }

    #[test]
    fn generated_keys_are_48_alphanumeric_chars() {
        let key = generate_key();
        assert_eq!(key.len(), KEY_LENGTH);
        assert!(key.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(key, generate_key());
    }

    #[tokio::test]
    async fn issue_checks_user_and_name() {
        let (service, store) = service_with_user().await;

        assert_matches!(
            service.issue(TokenInput { user_id: 0, ..input("a") }).await,
            Err(TokenError::InvalidUserId)
        );
        assert_matches!(
            service.issue(TokenInput { user_id: 99, ..input("a") }).await,
            Err(TokenError::UserNotFound)
        );
        assert_matches!(
            service.issue(input(&"n".repeat(31))).await,
            Err(TokenError::NameTooLong)
        );

        let key = service.issue(input("ci")).await.unwrap();
        let token = store.get_token_by_key(&key).await.unwrap().unwrap();
        assert_eq!(token.status, TokenStatus::Enabled);
        assert_eq!(token.remain_quota, 1000);
    }

    #[tokio::test]
    async fn update_rejects_long_name_without_changes() {
        let (service, store) = service_with_user().await;
        let key = service.issue(input("ci")).await.unwrap();

        let err = service
            .update(&key, false, input(&"n".repeat(31)))
            .await
            .unwrap_err();
        assert_matches!(err, TokenError::NameTooLong);
        let token = store.get_token_by_key(&key).await.unwrap().unwrap();
        assert_eq!(token.name, "ci");
    }

    #[tokio::test]
    async fn unknown_or_missing_key_is_rejected() {
        let (service, _) = service_with_user().await;
        assert_matches!(
            service.update("", true, TokenInput::default()).await,
            Err(TokenError::MissingKey)
        );
        assert_matches!(
            service.update("nope", true, TokenInput::default()).await,
            Err(TokenError::InvalidToken)
        );
    }

    #[tokio::test]
    async fn enabling_expired_or_exhausted_token_is_refused() {
        let (service, store) = service_with_user().await;
        let key = service.issue(input("ci")).await.unwrap();
        let mut token = store.get_token_by_key(&key).await.unwrap().unwrap();

        token.status = TokenStatus::Expired;
        token.expired_time = 1;
        store.update_token(&token).await.unwrap();
        let enable = TokenInput {
            status: Some(TokenStatus::Enabled),
            ..TokenInput::default()
        };
        assert_matches!(
            service.update(&key, true, enable.clone()).await,
            Err(TokenError::CannotEnableExpired)
        );

        token.status = TokenStatus::Exhausted;
        token.expired_time = -1;
        token.remain_quota = 0;
        store.update_token(&token).await.unwrap();
        assert_matches!(
            service.update(&key, true, enable.clone()).await,
            Err(TokenError::CannotEnableExhausted)
        );

        token.unlimited_quota = true;
        store.update_token(&token).await.unwrap();
        let updated = service.update(&key, true, enable).await.unwrap();
        assert_eq!(updated.status, TokenStatus::Enabled);
    }

    #[tokio::test]
    async fn status_only_update_keeps_other_fields() {
        let (service, store) = service_with_user().await;
        let key = service.issue(input("ci")).await.unwrap();
        let disable = TokenInput {
            name: "renamed".to_string(),
            status: Some(TokenStatus::Disabled),
            ..TokenInput::default()
        };
        service.update(&key, true, disable).await.unwrap();
        let token = store.get_token_by_key(&key).await.unwrap().unwrap();
        assert_eq!(token.status, TokenStatus::Disabled);
        assert_eq!(token.name, "ci");
        assert_eq!(token.remain_quota, 1000);
    }

    #[tokio::test]
    async fn validation_persists_derived_status() {
        let (service, store) = service_with_user().await;
        let key = service.issue(TokenInput { expired_time: 100, ..input("ci") }).await.unwrap();

        assert!(service.validate_key(&key, 50).await.is_ok());
        assert_matches!(service.validate_key(&key, 100).await, Err(TokenError::Expired));
        let token = store.get_token_by_key(&key).await.unwrap().unwrap();
        assert_eq!(token.status, TokenStatus::Expired);

        let key = service.issue(TokenInput { remain_quota: 0, ..input("empty") }).await.unwrap();
        assert_matches!(service.validate_key(&key, 0).await, Err(TokenError::Exhausted));
        let token = store.get_token_by_key(&key).await.unwrap().unwrap();
        assert_eq!(token.status, TokenStatus::Exhausted);
    }

    #[tokio::test]
    async fn validation_returns_the_stored_record() {
        let (service, store) = service_with_user().await;
        let key = service.issue(input("ci")).await.unwrap();
        let stored = store.get_token_by_key(&key).await.unwrap().unwrap();

        let validated = service.validate_key(&key, stored.accessed_time + 3_600).await.unwrap();
        assert_eq!(validated, stored);
        assert_eq!(store.get_token_by_key(&key).await.unwrap().unwrap(), stored);
    }
}
