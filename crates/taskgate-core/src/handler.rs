use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde_json::json;
use tracing::{Instrument, info_span};

use crate::core::CoreState;
use crate::relay::Caller;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const TOKEN_ID_HEADER: &str = "x-token-id";

pub async fn health_handler() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

pub async fn submit_task_handler(
    State(state): State<Arc<CoreState>>,
    Path(channel_id): Path<i64>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(caller) = caller_from_headers(&headers) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "code": "unauthorized", "message": "missing or invalid caller identity" })),
        )
            .into_response();
    };
    let span = info_span!(
        "submit_task",
        trace_id = %trace_id(&headers),
        channel_id = channel_id,
        user_id = caller.user_id
    );
    match state
        .relay
        .submit(channel_id, caller, &body)
        .instrument(span)
        .await
    {
        Ok(response) => Json(response).into_response(),
        Err(err) => err.into_response(),
    }
}

pub async fn fetch_task_handler(
    State(state): State<Arc<CoreState>>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let span = info_span!("fetch_task", trace_id = %trace_id(&headers), task_id = %task_id);
    match state.relay.refresh(&task_id).instrument(span).await {
        Ok(view) => Json(view).into_response(),
        Err(err) => err.into_response(),
    }
}

fn caller_from_headers(headers: &HeaderMap) -> Option<Caller> {
    let user_id = header_i64(headers, USER_ID_HEADER).filter(|id| *id > 0)?;
    let token_id = header_i64(headers, TOKEN_ID_HEADER).filter(|id| *id > 0);
    Some(Caller { user_id, token_id })
}

fn header_i64(headers: &HeaderMap, name: &str) -> Option<i64> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

fn trace_id(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .or_else(|| headers.get("request-id"))
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}
