use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use crate::account::AccountService;
use crate::handler::{fetch_task_handler, health_handler, submit_task_handler};
use crate::ledger::{QuotaLedger, QuotaRates};
use crate::relay::{ChannelLookup, TaskRelay};
use crate::store::Stores;
use crate::sync;
use crate::token::TokenService;

pub struct CoreState {
    pub relay: TaskRelay,
    pub ledger: QuotaLedger,
    pub tokens: TokenService,
    pub accounts: AccountService,
}

pub struct Core {
    state: Arc<CoreState>,
}

impl Core {
    pub fn new(lookup: ChannelLookup, stores: Stores, rates: QuotaRates) -> Self {
        let tokens = TokenService::new(stores.tokens.clone(), stores.accounts.clone());
        let ledger = QuotaLedger::new(
            stores.tasks.clone(),
            stores.accounts.clone(),
            stores.tokens.clone(),
            stores.logs.clone(),
            rates,
        );
        let relay = TaskRelay::new(
            lookup,
            stores.tasks.clone(),
            stores.accounts.clone(),
            tokens.clone(),
            ledger.clone(),
        );
        let accounts = AccountService::new(stores.accounts);
        Self {
            state: Arc::new(CoreState {
                relay,
                ledger,
                tokens,
                accounts,
            }),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/healthz", get(health_handler))
            .route("/v1/video/generations/{channel_id}", post(submit_task_handler))
            .route("/v1/video/generations/tasks/{task_id}", get(fetch_task_handler))
            .route(
                "/api/sync/user",
                post(sync::provision_user).get(sync::user_summary),
            )
            .route("/api/sync/user/exists", post(sync::ensure_user))
            .route("/api/sync/user/quota", post(sync::topup))
            .route("/api/sync/token", post(sync::issue_token))
            .route("/api/sync/token/update", post(sync::update_token))
            .route("/api/sync/log", get(sync::list_logs))
            .route("/api/sync/log/stat", get(sync::log_stat))
            .with_state(self.state.clone())
    }

    pub fn state(&self) -> Arc<CoreState> {
        self.state.clone()
    }
}
