//! Routes the external account system calls to mirror users, credentials and
//! balances into the gateway.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;

use crate::account::{EnsureOutcome, EnsureRequest, ProvisionRequest};
use crate::core::CoreState;
use crate::ledger::PageQuery;
use crate::response::{ApiResponse, failure};
use crate::store::LogFilter;
use crate::token::TokenInput;

type Params = Query<HashMap<String, String>>;

fn bad_body(rejection: JsonRejection) -> Response {
    failure(StatusCode::BAD_REQUEST, rejection.body_text())
}

pub async fn provision_user(
    State(state): State<Arc<CoreState>>,
    payload: Result<Json<ProvisionRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return bad_body(rejection),
    };
    match state.accounts.provision(request).await {
        Ok(account) => ApiResponse::ok("user created", account).into_response(),
        Err(err) => err.into_response(),
    }
}

pub async fn ensure_user(
    State(state): State<Arc<CoreState>>,
    payload: Result<Json<EnsureRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            return failure(
                StatusCode::BAD_REQUEST,
                format!("invalid request parameters: {}", rejection.body_text()),
            );
        }
    };
    match state.accounts.ensure(request).await {
        Ok(EnsureOutcome::Existing) => ApiResponse::message("user exists").into_response(),
        Ok(EnsureOutcome::Created) => ApiResponse::message("user created").into_response(),
        Err(err) => err.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct TopupRequest {
    pub user_id: i64,
    pub quota_rmb: f64,
}

pub async fn topup(
    State(state): State<Arc<CoreState>>,
    headers: HeaderMap,
    payload: Result<Json<TopupRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return bad_body(rejection),
    };
    let ip = client_ip(&headers);
    match state
        .ledger
        .topup(request.user_id, request.quota_rmb, &ip)
        .await
    {
        Ok(outcome) => {
            let message = format!(
                "top up succeeded, added {} units, current quota: {}",
                outcome.added, outcome.account.quota
            );
            let mut body = json!({
                "success": true,
                "message": message,
                "data": outcome.account,
            });
            if let Some(warning) = outcome.log_warning {
                body["warning"] = json!(warning);
            }
            Json(body).into_response()
        }
        Err(err) => err.into_response(),
    }
}

pub async fn user_summary(State(state): State<Arc<CoreState>>, Query(params): Params) -> Response {
    let Some(raw) = params.get("user_id").filter(|value| !value.is_empty()) else {
        return failure(
            StatusCode::BAD_REQUEST,
            "invalid user id: provide user_id as a query parameter",
        );
    };
    let Ok(user_id) = raw.parse::<i64>() else {
        return failure(StatusCode::BAD_REQUEST, "invalid user id: must be an integer");
    };
    if user_id <= 0 {
        return failure(StatusCode::BAD_REQUEST, "invalid user id: must be positive");
    }
    match state.ledger.summary(user_id).await {
        Ok(summary) => ApiResponse::ok("ok", summary).into_response(),
        Err(err) => err.into_response(),
    }
}

pub async fn issue_token(
    State(state): State<Arc<CoreState>>,
    payload: Result<Json<TokenInput>, JsonRejection>,
) -> Response {
    let Json(input) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return bad_body(rejection),
    };
    match state.tokens.issue(input).await {
        Ok(key) => ApiResponse::ok("token created", key).into_response(),
        Err(err) => err.into_response(),
    }
}

pub async fn update_token(
    State(state): State<Arc<CoreState>>,
    Query(params): Params,
    payload: Result<Json<TokenInput>, JsonRejection>,
) -> Response {
    let key = params.get("key").cloned().unwrap_or_default();
    let status_only = params
        .get("status_only")
        .is_some_and(|value| !value.is_empty());
    if key.is_empty() {
        return failure(StatusCode::BAD_REQUEST, "token key is required");
    }
    let Json(input) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return bad_body(rejection),
    };
    match state.tokens.update(&key, status_only, input).await {
        Ok(_) => ApiResponse::message("token updated").into_response(),
        Err(err) => err.into_response(),
    }
}

pub async fn list_logs(State(state): State<Arc<CoreState>>, Query(params): Params) -> Response {
    let filter = log_filter(&params);
    let page = PageQuery {
        p: number(&params, "p").unwrap_or(1),
        page_size: number(&params, "page_size").unwrap_or(0),
    };
    match state.ledger.logs(&filter, page).await {
        Ok(page) => ApiResponse::ok("", page).into_response(),
        Err(err) => err.into_response(),
    }
}

pub async fn log_stat(State(state): State<Arc<CoreState>>, Query(params): Params) -> Response {
    let filter = log_filter(&params);
    let user_id = number::<i64>(&params, "user_id");
    match state.ledger.stat(user_id, filter).await {
        Ok(stat) => ApiResponse::ok("ok", stat).into_response(),
        Err(err) => err.into_response(),
    }
}

/// Unparsable or zero numeric filters mean "no filter".
fn log_filter(params: &HashMap<String, String>) -> LogFilter {
    let text = |key: &str| params.get(key).filter(|value| !value.is_empty()).cloned();
    LogFilter {
        log_type: number::<i32>(params, "type").filter(|value| *value != 0),
        user_id: number::<i64>(params, "user_id").filter(|id| *id > 0),
        username: text("username"),
        token_name: text("token_name"),
        model_name: text("model_name"),
        channel_id: number::<i64>(params, "channel").filter(|id| *id > 0),
        group: text("group"),
        start_timestamp: number::<i64>(params, "start_timestamp").filter(|ts| *ts > 0),
        end_timestamp: number::<i64>(params, "end_timestamp").filter(|ts| *ts > 0),
    }
}

fn number<T: FromStr>(params: &HashMap<String, String>, key: &str) -> Option<T> {
    params.get(key).and_then(|value| value.trim().parse().ok())
}

fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|value| value.to_str().ok())
        })
        .map(|value| value.trim().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::core::Core;
    use crate::ledger::QuotaRates;
    use crate::relay::ChannelLookup;
    use crate::store::Stores;

    fn router() -> axum::Router {
        let lookup: ChannelLookup = Arc::new(|_: i64| None);
        Core::new(lookup, Stores::memory(), QuotaRates::default()).router()
    }

    async fn send(
        router: &axum::Router,
        method: Method,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let body = match body {
            Some(value) => Body::from(value.to_string()),
            None => Body::empty(),
        };
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .header("content-type", "application/json")
                    .header("x-forwarded-for", "203.0.113.9")
                    .body(body)
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn provision_alice(router: &axum::Router) {
        let (status, body) = send(
            router,
            Method::POST,
            "/api/sync/user",
            Some(json!({ "id": 1, "username": "alice", "password": "correct-horse" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert!(body["data"].get("password").is_none());
    }

    #[tokio::test]
    async fn duplicate_user_is_400() {
        let router = router();
        provision_alice(&router).await;
        let (status, body) = send(
            &router,
            Method::POST,
            "/api/sync/user",
            Some(json!({ "id": 2, "username": "alice", "password": "correct-horse" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(body["message"], "user already exists");
    }

    #[tokio::test]
    async fn ensure_accepts_string_ids() {
        let router = router();
        let payload = json!({ "user_id": "12", "user_name": "dave" });
        let (_, body) = send(&router, Method::POST, "/api/sync/user/exists", Some(payload.clone())).await;
        assert_eq!(body["message"], "user created");
        let (_, body) = send(&router, Method::POST, "/api/sync/user/exists", Some(payload)).await;
        assert_eq!(body["message"], "user exists");
    }

    #[tokio::test]
    async fn topup_then_summary() {
        let router = router();
        provision_alice(&router).await;

        let (status, body) = send(
            &router,
            Method::POST,
            "/api/sync/user/quota",
            Some(json!({ "user_id": 1, "quota_rmb": 73.0 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["quota"], 5_000_000);

        let (status, body) = send(&router, Method::GET, "/api/sync/user?user_id=1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["quota_dollar"], 10.0);
        assert_eq!(body["data"]["quota_rmb"], 73.0);

        let (_, body) = send(&router, Method::GET, "/api/sync/log?type=1", None).await;
        assert_eq!(body["data"]["total"], 1);
        assert_eq!(body["data"]["items"][0]["ip"], "203.0.113.9");
        assert_eq!(body["data"]["items"][0]["quota_rmb"], 73.0);
    }

    #[tokio::test]
    async fn summary_rejects_bad_ids() {
        let router = router();
        let (status, _) = send(&router, Method::GET, "/api/sync/user", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = send(&router, Method::GET, "/api/sync/user?user_id=abc", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, body) = send(&router, Method::GET, "/api/sync/user?user_id=5", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "user not found");
    }

    #[tokio::test]
    async fn token_issue_and_update_status_convention() {
        let router = router();

        let (status, _) = send(
            &router,
            Method::POST,
            "/api/sync/token",
            Some(json!({ "user_id": 1, "name": "ci" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        provision_alice(&router).await;
        let (status, body) = send(
            &router,
            Method::POST,
            "/api/sync/token",
            Some(json!({ "user_id": 1, "name": "n".repeat(31) })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], false);

        let (_, body) = send(
            &router,
            Method::POST,
            "/api/sync/token",
            Some(json!({ "user_id": 1, "name": "ci", "expired_time": -1 })),
        )
        .await;
        let key = body["data"].as_str().unwrap().to_string();
        assert_eq!(key.len(), 48);

        let (status, _) = send(
            &router,
            Method::POST,
            "/api/sync/token/update?status_only=1",
            Some(json!({ "status": 2 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            &router,
            Method::POST,
            &format!("/api/sync/token/update?key={key}&status_only=1"),
            Some(json!({ "status": 2 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
    }

    #[tokio::test]
    async fn stat_for_unknown_user_succeeds() {
        let router = router();
        let (status, body) = send(&router, Method::GET, "/api/sync/log/stat?user_id=77", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], json!({ "quota": 0, "rpm": 0, "tpm": 0 }));
    }

    #[tokio::test]
    async fn unknown_log_type_returns_no_rows() {
        let router = router();
        provision_alice(&router).await;
        send(
            &router,
            Method::POST,
            "/api/sync/user/quota",
            Some(json!({ "user_id": 1, "quota_rmb": 7.3 })),
        )
        .await;

        let (_, body) = send(&router, Method::GET, "/api/sync/log?type=0", None).await;
        assert_eq!(body["data"]["total"], 1);
        let (status, body) = send(&router, Method::GET, "/api/sync/log?type=9", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["total"], 0);
        assert_eq!(body["data"]["items"], json!([]));
    }

    #[tokio::test]
    async fn oversized_topup_is_400() {
        let router = router();
        provision_alice(&router).await;
        let (status, body) = send(
            &router,
            Method::POST,
            "/api/sync/user/quota",
            Some(json!({ "user_id": 1, "quota_rmb": 1e300 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        let (_, body) = send(&router, Method::GET, "/api/sync/user?user_id=1", None).await;
        assert_eq!(body["data"]["quota"], 0);
    }
}
